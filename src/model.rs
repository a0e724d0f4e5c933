//! Transformer Classifier
//!
//! A 12-layer-style post-norm transformer fine-tuned for binary text
//! classification with an auxiliary language-modeling objective. The model
//! owns a single combined embedding table `we` holding the token vocabulary
//! followed by one learned vector per sequence position, so position lookups
//! are plain row reads with ids offset by the vocabulary size.
//!
//! Two heads share the trunk:
//!
//! * The **LM head** reuses the token rows of `we` as output weights
//!   (tied embeddings): `logits = h[0..T-1] @ we_tok^T`, cross-entropy
//!   against the next token, masked so padding and the first position
//!   contribute nothing, averaged per sequence.
//! * The **classifier head** pools the hidden state at the classification
//!   token and projects it to two logits through `clf_w`/`clf_b`.
//!
//! The combined training loss is `mean(clf) + lm_coef * mean(lm)`.
//!
//! Embedding dropout is applied to the table itself, once per forward pass,
//! so the embedding lookup and the tied LM head see the same mask and the
//! backward pass chains both gradients through it.

use crate::config::Config;
use crate::error::{FinetuneError, Result};
use crate::formatter::InputBatch;
use crate::layers::{
    block_backward, block_forward, dropout_backward, dropout_forward, BlockCache, BlockGrads,
    BlockParams, DropoutCache,
};
use crate::layers::randn_init;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::ops::Range;

/// All learnable tensors, in creation order: the combined embedding table,
/// twelve tensors per block, then the classifier projection.
pub struct Parameters {
    /// Combined embedding table `[n_vocab + max_length, n_embd]`.
    pub we: Tensor,
    pub blocks: Vec<BlockParams>,
    /// Classifier projection `[n_embd, 2]`.
    pub clf_w: Tensor,
    pub clf_b: Tensor,
}

impl Parameters {
    pub fn new(config: &Config, n_vocab: usize, rng: &mut StdRng) -> Self {
        let d = config.n_embd;
        let rows = n_vocab + config.max_length;
        let we = Tensor::new(randn_init(rows * d, config.weight_stddev, rng), vec![rows, d]);
        let blocks = (0..config.n_layer)
            .map(|_| BlockParams::new(d, config.weight_stddev, rng))
            .collect();
        let clf_w = Tensor::new(randn_init(d * 2, config.weight_stddev, rng), vec![d, 2]);
        let clf_b = Tensor::zeros(vec![2]);
        Parameters {
            we,
            blocks,
            clf_w,
            clf_b,
        }
    }

    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = vec![&self.we];
        for b in &self.blocks {
            out.extend(b.tensors());
        }
        out.push(&self.clf_w);
        out.push(&self.clf_b);
        out
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = vec![&mut self.we];
        for b in &mut self.blocks {
            out.extend(b.tensors_mut());
        }
        out.push(&mut self.clf_w);
        out.push(&mut self.clf_b);
        out
    }

    /// Human-readable tensor names matching [`tensors`](Self::tensors) order.
    pub fn names(&self) -> Vec<String> {
        let mut out = vec!["we".to_string()];
        for l in 0..self.blocks.len() {
            for name in [
                "attn/qkv/w",
                "attn/qkv/b",
                "attn/proj/w",
                "attn/proj/b",
                "ln_1/g",
                "ln_1/b",
                "mlp/fc/w",
                "mlp/fc/b",
                "mlp/proj/w",
                "mlp/proj/b",
                "ln_2/g",
                "ln_2/b",
            ] {
                out.push(format!("h{}/{}", l, name));
            }
        }
        out.push("clf/w".to_string());
        out.push("clf/b".to_string());
        out
    }
}

/// Gradient accumulators matching [`Parameters`] tensor for tensor.
#[derive(Debug)]
pub struct Gradients {
    pub we: Tensor,
    pub blocks: Vec<BlockGrads>,
    pub clf_w: Tensor,
    pub clf_b: Tensor,
}

impl Gradients {
    pub fn zeros(params: &Parameters) -> Self {
        Gradients {
            we: Tensor::zeros(params.we.shape.clone()),
            blocks: params.blocks.iter().map(BlockGrads::zeros).collect(),
            clf_w: Tensor::zeros(params.clf_w.shape.clone()),
            clf_b: Tensor::zeros(params.clf_b.shape.clone()),
        }
    }

    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = vec![&self.we];
        for b in &self.blocks {
            out.extend(b.tensors());
        }
        out.push(&self.clf_w);
        out.push(&self.clf_b);
        out
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = vec![&mut self.we];
        for b in &mut self.blocks {
            out.extend(b.tensors_mut());
        }
        out.push(&mut self.clf_w);
        out.push(&mut self.clf_b);
        out
    }

    /// Element-wise `self += other`.
    pub fn accumulate(&mut self, other: &Gradients) {
        let others = other.tensors();
        for (dst, src) in self.tensors_mut().into_iter().zip(others) {
            dst.data
                .par_iter_mut()
                .zip(&src.data)
                .for_each(|(d, s)| *d += s);
        }
    }

    /// Element-wise `self *= factor`.
    pub fn scale(&mut self, factor: f32) {
        for t in self.tensors_mut() {
            t.data.par_iter_mut().for_each(|v| *v *= factor);
        }
    }
}

/// Per-example activations recorded for backward.
struct ExampleCache {
    tokens: Vec<usize>,
    positions: Vec<usize>,
    mask: Vec<f32>,
    label: usize,
    block_caches: Vec<BlockCache>,
    /// Final block output `[T, n_embd]`.
    h: Tensor,
    pool_idx: usize,
    /// Per-example classifier dropout factor (scale, or zero when dropped).
    clf_factor: f32,
    /// Pooled hidden state after classifier dropout.
    pooled_d: Vec<f32>,
    clf_logits: Vec<f32>,
    lm_denom: f32,
}

/// Activations a backward pass needs, for one contiguous slice of a batch.
pub struct ShardCache {
    /// Embedding table after dropout, shared by lookup and LM head.
    we_d: Tensor,
    we_cache: DropoutCache,
    /// Token rows of `we_d`, the tied LM output weights.
    we_tok: Tensor,
    examples: Vec<ExampleCache>,
}

/// Losses and logits from one forward pass.
pub struct ForwardOutput {
    /// `[n, 2]` classifier logits for the examples in the range.
    pub clf_logits: Tensor,
    pub clf_losses: Vec<f32>,
    pub lm_losses: Vec<f32>,
}

/// Transformer with a tied-embedding LM head and a binary classifier head.
pub struct TransformerClassifier {
    config: Config,
    n_vocab: usize,
    clf_token: usize,
    pub params: Parameters,
}

fn log_sum_exp(row: &[f32]) -> f32 {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    max + row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln()
}

fn softmax_row(row: &[f32]) -> Vec<f32> {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

impl TransformerClassifier {
    pub fn new(config: Config, n_vocab: usize, clf_token: usize, rng: &mut StdRng) -> Result<Self> {
        let params = Parameters::new(&config, n_vocab, rng);
        Self::from_parts(config, n_vocab, clf_token, params)
    }

    /// Wrap already-built parameters, e.g. restored from a checkpoint.
    pub fn from_parts(
        config: Config,
        n_vocab: usize,
        clf_token: usize,
        params: Parameters,
    ) -> Result<Self> {
        if config.n_embd % config.n_head != 0 {
            return Err(FinetuneError::EmbedDimNotDivisible {
                n_embd: config.n_embd,
                n_head: config.n_head,
            });
        }
        Ok(TransformerClassifier {
            config,
            n_vocab,
            clf_token,
            params,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    pub fn clf_token(&self) -> usize {
        self.clf_token
    }

    /// Run the trunk for one example and return the block caches plus the
    /// final hidden states.
    fn trunk(
        &self,
        we_d: &Tensor,
        tokens: &[usize],
        positions: &[usize],
        training: bool,
        rng: &mut StdRng,
    ) -> (Vec<BlockCache>, Tensor) {
        let d = self.config.n_embd;
        let seq_len = tokens.len();

        let mut h = Tensor::zeros(vec![seq_len, d]);
        for t in 0..seq_len {
            let tok_row = we_d.row(tokens[t]);
            let pos_row = we_d.row(positions[t]);
            let out = h.row_mut(t);
            for j in 0..d {
                out[j] = tok_row[j] + pos_row[j];
            }
        }

        let mut block_caches = Vec::with_capacity(self.params.blocks.len());
        for block in &self.params.blocks {
            let (next, cache) = block_forward(
                &h,
                block,
                self.config.n_head,
                self.config.attn_pdrop,
                self.config.resid_pdrop,
                training,
                rng,
            );
            block_caches.push(cache);
            h = next;
        }

        (block_caches, h)
    }

    /// Forward pass over a contiguous slice `range` of the batch.
    ///
    /// `m` is the language-modeling mask from
    /// [`array_format`](crate::formatter::array_format) and `y` the labels
    /// for the whole batch; both are indexed by absolute example index.
    pub fn forward(
        &self,
        x: &InputBatch,
        m: &Tensor,
        y: &[usize],
        range: Range<usize>,
        training: bool,
        rng: &mut StdRng,
    ) -> (ForwardOutput, ShardCache) {
        let seq_len = x.max_length;
        let d = self.config.n_embd;

        let (we_d, we_cache) = dropout_forward(&self.params.we, self.config.embd_pdrop, training, rng);
        let we_tok = we_d.slice_rows(0, self.n_vocab);

        let n = range.len();
        let mut clf_logits = Tensor::zeros(vec![n, 2]);
        let mut clf_losses = Vec::with_capacity(n);
        let mut lm_losses = Vec::with_capacity(n);
        let mut examples = Vec::with_capacity(n);

        for (out_idx, b) in range.enumerate() {
            let tokens: Vec<usize> = (0..seq_len).map(|t| x.token(b, t)).collect();
            let positions: Vec<usize> = (0..seq_len).map(|t| x.position(b, t)).collect();
            let mask: Vec<f32> = m.row(b).to_vec();

            let (block_caches, h) = self.trunk(&we_d, &tokens, &positions, training, rng);

            // Language modeling: predict token t+1 from hidden state t, with
            // padding (and the first position) masked out.
            let h_lm = h.slice_rows(0, seq_len - 1);
            let logits = h_lm.matmul_transpose_b(&we_tok);
            let denom: f32 = mask[1..].iter().sum::<f32>().max(1.0);
            let mut lm_sum = 0.0;
            for t in 0..seq_len - 1 {
                let w = mask[t + 1];
                if w == 0.0 {
                    continue;
                }
                let row = logits.row(t);
                let target = tokens[t + 1];
                lm_sum += w * (log_sum_exp(row) - row[target]);
            }
            let lm_loss = lm_sum / denom;

            // Classifier head: pool at the classification token.
            let pool_idx = tokens
                .iter()
                .position(|&tok| tok == self.clf_token)
                .unwrap_or(0);
            let clf_factor = if !training || self.config.clf_pdrop == 0.0 {
                1.0
            } else if rng.gen::<f32>() > self.config.clf_pdrop {
                1.0 / (1.0 - self.config.clf_pdrop)
            } else {
                0.0
            };
            let pooled_d: Vec<f32> = h.row(pool_idx).iter().map(|v| v * clf_factor).collect();

            let mut logits2 = vec![0.0f32; 2];
            for c in 0..2 {
                let mut acc = self.params.clf_b.data[c];
                for j in 0..d {
                    acc += pooled_d[j] * self.params.clf_w.data[j * 2 + c];
                }
                logits2[c] = acc;
            }
            let label = y[b];
            let clf_loss = log_sum_exp(&logits2) - logits2[label];

            clf_logits.row_mut(out_idx).copy_from_slice(&logits2);
            clf_losses.push(clf_loss);
            lm_losses.push(lm_loss);
            examples.push(ExampleCache {
                tokens,
                positions,
                mask,
                label,
                block_caches,
                h,
                pool_idx,
                clf_factor,
                pooled_d,
                clf_logits: logits2,
                lm_denom: denom,
            });
        }

        (
            ForwardOutput {
                clf_logits,
                clf_losses,
                lm_losses,
            },
            ShardCache {
                we_d,
                we_cache,
                we_tok,
                examples,
            },
        )
    }

    /// Backward pass for `loss = mean(clf) + lm_coef * mean(lm)` over the
    /// examples recorded in `cache`.
    pub fn backward(&self, cache: &ShardCache) -> Gradients {
        let seq_len = self.config.max_length;
        let d = self.config.n_embd;
        let n = cache.examples.len();
        let inv_n = 1.0 / n as f32;
        let lm_coef = self.config.lm_coef;

        let mut grads = Gradients::zeros(&self.params);
        // Gradient w.r.t. the post-dropout table; the dropout mask is
        // replayed once at the end.
        let mut grad_we_d = Tensor::zeros(self.params.we.shape.clone());

        for ex in &cache.examples {
            let mut grad_h = Tensor::zeros(vec![seq_len, d]);

            // Classifier head.
            let probs = softmax_row(&ex.clf_logits);
            let mut grad_logits2 = [0.0f32; 2];
            for c in 0..2 {
                let target = if c == ex.label { 1.0 } else { 0.0 };
                grad_logits2[c] = (probs[c] - target) * inv_n;
            }
            for j in 0..d {
                for c in 0..2 {
                    grads.clf_w.data[j * 2 + c] += ex.pooled_d[j] * grad_logits2[c];
                }
            }
            for c in 0..2 {
                grads.clf_b.data[c] += grad_logits2[c];
            }
            {
                let row = grad_h.row_mut(ex.pool_idx);
                for j in 0..d {
                    let mut acc = 0.0;
                    for c in 0..2 {
                        acc += grad_logits2[c] * self.params.clf_w.data[j * 2 + c];
                    }
                    row[j] += acc * ex.clf_factor;
                }
            }

            // LM head; logits are cheap to recompute relative to caching
            // a [T-1, n_vocab] tensor per example.
            if lm_coef != 0.0 {
                let h_lm = ex.h.slice_rows(0, seq_len - 1);
                let logits = h_lm.matmul_transpose_b(&cache.we_tok);
                let mut grad_logits = Tensor::zeros(logits.shape.clone());
                for t in 0..seq_len - 1 {
                    let w = ex.mask[t + 1];
                    if w == 0.0 {
                        continue;
                    }
                    let weight = lm_coef * w / ex.lm_denom * inv_n;
                    let probs = softmax_row(logits.row(t));
                    let target = ex.tokens[t + 1];
                    let out = grad_logits.row_mut(t);
                    for (v, p) in out.iter_mut().zip(probs) {
                        *v = p * weight;
                    }
                    out[target] -= weight;
                }

                let grad_h_lm = grad_logits.matmul(&cache.we_tok);
                for t in 0..seq_len - 1 {
                    let src = grad_h_lm.row(t);
                    let dst = grad_h.row_mut(t);
                    for j in 0..d {
                        dst[j] += src[j];
                    }
                }

                // Tied weights: the LM logits also differentiate through the
                // token rows of the table.
                let grad_we_tok = grad_logits.matmul_transpose_a(&h_lm);
                for v_row in 0..self.n_vocab {
                    let src = grad_we_tok.row(v_row);
                    let dst = grad_we_d.row_mut(v_row);
                    for j in 0..d {
                        dst[j] += src[j];
                    }
                }
            }

            // Trunk, in reverse.
            for (l, block_cache) in ex.block_caches.iter().enumerate().rev() {
                let (block_grads, grad_x) = block_backward(
                    &grad_h,
                    &self.params.blocks[l],
                    block_cache,
                    self.config.n_head,
                );
                grads.blocks[l]
                    .tensors_mut()
                    .into_iter()
                    .zip(block_grads.tensors())
                    .for_each(|(dst, src)| {
                        for (a, b) in dst.data.iter_mut().zip(&src.data) {
                            *a += b;
                        }
                    });
                grad_h = grad_x;
            }

            // Embedding scatter: each position contributed a token row and a
            // position row.
            for t in 0..seq_len {
                let src: Vec<f32> = grad_h.row(t).to_vec();
                let tok_dst = grad_we_d.row_mut(ex.tokens[t]);
                for j in 0..d {
                    tok_dst[j] += src[j];
                }
                let pos_dst = grad_we_d.row_mut(ex.positions[t]);
                for j in 0..d {
                    pos_dst[j] += src[j];
                }
            }
        }

        grads.we = dropout_backward(&grad_we_d, &cache.we_cache);
        grads
    }

    /// Classifier logits for a whole formatted batch, evaluation mode.
    pub fn predict_logits(&self, x: &InputBatch) -> Tensor {
        let seq_len = x.max_length;
        let d = self.config.n_embd;

        let rows: Vec<Vec<f32>> = (0..x.n)
            .into_par_iter()
            .map(|b| {
                let tokens: Vec<usize> = (0..seq_len).map(|t| x.token(b, t)).collect();
                let positions: Vec<usize> = (0..seq_len).map(|t| x.position(b, t)).collect();
                // Evaluation mode never draws from the generator.
                let mut rng = StdRng::seed_from_u64(0);
                let (_, h) = self.trunk(&self.params.we, &tokens, &positions, false, &mut rng);

                let pool_idx = tokens
                    .iter()
                    .position(|&tok| tok == self.clf_token)
                    .unwrap_or(0);
                let pooled = h.row(pool_idx);

                let mut logits = vec![0.0f32; 2];
                for c in 0..2 {
                    let mut acc = self.params.clf_b.data[c];
                    for j in 0..d {
                        acc += pooled[j] * self.params.clf_w.data[j * 2 + c];
                    }
                    logits[c] = acc;
                }
                logits
            })
            .collect();

        let mut out = Tensor::zeros(vec![x.n, 2]);
        for (b, row) in rows.iter().enumerate() {
            out.row_mut(b).copy_from_slice(row);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::array_format;

    fn tiny_setup() -> (TransformerClassifier, InputBatch, Tensor, Vec<usize>) {
        let config = Config::tiny();
        let n_vocab = 20;
        let mut rng = StdRng::seed_from_u64(1);
        let model = TransformerClassifier::new(config, n_vocab, 5, &mut rng).unwrap();
        let sequences = vec![
            vec![3, 7, 2, 5],
            vec![4, 9, 5],
            vec![1, 2, 3, 4, 5],
            vec![6, 5],
        ];
        let (x, m) = array_format(&sequences, 8, n_vocab);
        let y = vec![0, 1, 1, 0];
        (model, x, m, y)
    }

    #[test]
    fn forward_produces_finite_losses_and_logits() {
        let (model, x, m, y) = tiny_setup();
        let mut rng = StdRng::seed_from_u64(2);
        let (out, _) = model.forward(&x, &m, &y, 0..4, false, &mut rng);

        assert_eq!(out.clf_logits.shape, vec![4, 2]);
        assert_eq!(out.clf_losses.len(), 4);
        assert_eq!(out.lm_losses.len(), 4);
        assert!(out.clf_logits.data.iter().all(|v| v.is_finite()));
        assert!(out.clf_losses.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(out.lm_losses.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn backward_produces_gradients_for_every_tensor() {
        let (model, x, m, y) = tiny_setup();
        let mut rng = StdRng::seed_from_u64(3);
        let (_, cache) = model.forward(&x, &m, &y, 0..4, false, &mut rng);
        let grads = model.backward(&cache);

        for (g, p) in grads.tensors().iter().zip(model.params.tensors()) {
            assert_eq!(g.shape, p.shape);
            assert!(g.data.iter().all(|v| v.is_finite()));
        }
        // Something must flow into every major component.
        assert!(grads.we.data.iter().any(|v| *v != 0.0));
        assert!(grads.clf_w.data.iter().any(|v| *v != 0.0));
        assert!(grads.blocks[0].qkv_w.data.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn predict_logits_matches_eval_forward() {
        let (model, x, m, y) = tiny_setup();
        let mut rng = StdRng::seed_from_u64(4);
        let (out, _) = model.forward(&x, &m, &y, 0..4, false, &mut rng);
        let pred = model.predict_logits(&x);
        for i in 0..pred.data.len() {
            assert!((pred.data[i] - out.clf_logits.data[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn names_match_tensor_count() {
        let (model, _, _, _) = tiny_setup();
        assert_eq!(model.params.names().len(), model.params.tensors().len());
        assert_eq!(model.params.names()[0], "we");
        assert_eq!(model.params.names().last().map(String::as_str), Some("clf/b"));
    }
}
