//! Multi-Head Self-Attention
//!
//! Scaled dot-product attention over the full sequence with a fused QKV
//! projection:
//!
//! ```text
//! qkv = x @ W_qkv + b_qkv                 // [T, 3*n_embd]
//! per head: scores = (Q @ K^T) / √d_head
//!           weights = softmax(scores)
//!           out = dropout(weights) @ V
//! y = dropout(concat(heads) @ W_proj + b_proj)
//! ```
//!
//! Every position attends to every other position; the training signal for
//! left-to-right structure comes entirely from the language-modeling loss
//! framing, not from a mask. The √d_head scaling keeps the dot products from
//! pushing softmax into its flat, vanishing-gradient regions.
//!
//! ## Backward Pass
//!
//! The interesting step is softmax: it couples all elements of a row, so the
//! score gradient for each row is `a * (g - dot(a, g))` where `a` is the
//! softmax output and `g` the incoming gradient.

use super::dropout::{dropout_backward, dropout_forward, DropoutCache};
use super::linear::{linear_backward, linear_forward, LinearCache};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Per-head tensors recorded for backward.
struct HeadCache {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    /// Post-softmax attention weights, pre-dropout.
    weights: Tensor,
    /// Attention weights after dropout, as applied to V.
    weights_dropped: Tensor,
    drop_cache: DropoutCache,
}

/// Values an attention backward pass needs from forward.
pub struct AttentionCache {
    qkv_cache: LinearCache,
    heads: Vec<HeadCache>,
    concat_cache: LinearCache,
    resid_cache: DropoutCache,
}

/// Gradients of an attention layer.
pub struct AttentionGradients {
    pub qkv_w: Tensor,
    pub qkv_b: Tensor,
    pub proj_w: Tensor,
    pub proj_b: Tensor,
    /// Gradient to pass to the previous layer.
    pub x: Tensor,
}

/// Copy a column band `[.., start..start+width]` into its own tensor.
fn col_slice(x: &Tensor, start: usize, width: usize) -> Tensor {
    let rows = x.shape[0];
    let cols = x.shape[1];
    let mut data = Vec::with_capacity(rows * width);
    for i in 0..rows {
        data.extend_from_slice(&x.data[i * cols + start..i * cols + start + width]);
    }
    Tensor::new(data, vec![rows, width])
}

/// Add a narrow tensor into a column band of a wider one.
fn col_add(dst: &mut Tensor, start: usize, src: &Tensor) {
    let rows = src.shape[0];
    let width = src.shape[1];
    let cols = dst.shape[1];
    for i in 0..rows {
        for j in 0..width {
            dst.data[i * cols + start + j] += src.data[i * width + j];
        }
    }
}

/// Full-sequence multi-head attention forward.
#[allow(clippy::too_many_arguments)]
pub fn attention_forward(
    x: &Tensor,
    qkv_w: &Tensor,
    qkv_b: &Tensor,
    proj_w: &Tensor,
    proj_b: &Tensor,
    n_head: usize,
    attn_pdrop: f32,
    resid_pdrop: f32,
    training: bool,
    rng: &mut StdRng,
) -> (Tensor, AttentionCache) {
    let seq_len = x.shape[0];
    let n_embd = x.shape[1];
    let head_dim = n_embd / n_head;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let (qkv, qkv_cache) = linear_forward(x, qkv_w, qkv_b);

    let mut concat = Tensor::zeros(vec![seq_len, n_embd]);
    let mut heads = Vec::with_capacity(n_head);
    for h in 0..n_head {
        let q = col_slice(&qkv, h * head_dim, head_dim);
        let k = col_slice(&qkv, n_embd + h * head_dim, head_dim);
        let v = col_slice(&qkv, 2 * n_embd + h * head_dim, head_dim);

        let scores = q.matmul_transpose_b(&k).mul_scalar(scale);
        let weights = scores.softmax_rows();
        let (weights_dropped, drop_cache) = dropout_forward(&weights, attn_pdrop, training, rng);
        let out_h = weights_dropped.matmul(&v);
        col_add(&mut concat, h * head_dim, &out_h);

        heads.push(HeadCache {
            q,
            k,
            v,
            weights,
            weights_dropped,
            drop_cache,
        });
    }

    let (y_proj, concat_cache) = linear_forward(&concat, proj_w, proj_b);
    let (y, resid_cache) = dropout_forward(&y_proj, resid_pdrop, training, rng);

    (
        y,
        AttentionCache {
            qkv_cache,
            heads,
            concat_cache,
            resid_cache,
        },
    )
}

/// Backward through dropout, projection, the attention product, softmax, and
/// the fused QKV projection.
pub fn attention_backward(
    grad_out: &Tensor,
    qkv_w: &Tensor,
    proj_w: &Tensor,
    cache: &AttentionCache,
    n_head: usize,
) -> AttentionGradients {
    let seq_len = grad_out.shape[0];
    let n_embd = grad_out.shape[1];
    let head_dim = n_embd / n_head;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let grad_y_proj = dropout_backward(grad_out, &cache.resid_cache);
    let proj_grads = linear_backward(&grad_y_proj, proj_w, &cache.concat_cache);

    let mut grad_qkv = Tensor::zeros(vec![seq_len, 3 * n_embd]);
    for (h, hc) in cache.heads.iter().enumerate() {
        let grad_out_h = col_slice(&proj_grads.x, h * head_dim, head_dim);

        // out = weights_dropped @ V
        let grad_weights_dropped = grad_out_h.matmul_transpose_b(&hc.v);
        let grad_v = hc.weights_dropped.matmul_transpose_a(&grad_out_h);

        let grad_weights = dropout_backward(&grad_weights_dropped, &hc.drop_cache);

        // Softmax backward, per row: a * (g - dot(a, g)).
        let mut grad_scores = Tensor::zeros(vec![seq_len, seq_len]);
        for i in 0..seq_len {
            let a_row = hc.weights.row(i);
            let g_row = grad_weights.row(i);
            let dot: f32 = a_row.iter().zip(g_row.iter()).map(|(a, g)| a * g).sum();
            let out_row = grad_scores.row_mut(i);
            for j in 0..seq_len {
                out_row[j] = a_row[j] * (g_row[j] - dot);
            }
        }

        let grad_q = grad_scores.matmul(&hc.k).mul_scalar(scale);
        let grad_k = grad_scores.matmul_transpose_a(&hc.q).mul_scalar(scale);

        col_add(&mut grad_qkv, h * head_dim, &grad_q);
        col_add(&mut grad_qkv, n_embd + h * head_dim, &grad_k);
        col_add(&mut grad_qkv, 2 * n_embd + h * head_dim, &grad_v);
    }

    let qkv_grads = linear_backward(&grad_qkv, qkv_w, &cache.qkv_cache);

    AttentionGradients {
        qkv_w: qkv_grads.weight,
        qkv_b: qkv_grads.bias,
        proj_w: proj_grads.weight,
        proj_b: proj_grads.bias,
        x: qkv_grads.x,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::randn_init;
    use rand::SeedableRng;

    fn loss(y: &Tensor) -> f32 {
        y.data.iter().map(|v| 0.5 * v * v).sum()
    }

    #[test]
    fn attention_rows_mix_the_whole_sequence() {
        let mut rng = StdRng::seed_from_u64(5);
        let d = 8;
        let t = 4;
        let x = Tensor::new(randn_init(t * d, 1.0, &mut rng), vec![t, d]);
        let qkv_w = Tensor::new(randn_init(d * 3 * d, 0.2, &mut rng), vec![d, 3 * d]);
        let qkv_b = Tensor::new(vec![0.0; 3 * d], vec![3 * d]);
        let proj_w = Tensor::new(randn_init(d * d, 0.2, &mut rng), vec![d, d]);
        let proj_b = Tensor::new(vec![0.0; d], vec![d]);

        let (y, _) = attention_forward(
            &x, &qkv_w, &qkv_b, &proj_w, &proj_b, 2, 0.0, 0.0, false, &mut rng,
        );
        assert_eq!(y.shape, vec![t, d]);
        assert!(y.data.iter().all(|v| v.is_finite()));

        // With no mask, perturbing the *last* position changes row 0 too.
        let mut x2 = x.clone();
        x2.data[(t - 1) * d] += 1.0;
        let (y2, _) = attention_forward(
            &x2, &qkv_w, &qkv_b, &proj_w, &proj_b, 2, 0.0, 0.0, false, &mut rng,
        );
        let row0_changed = (0..d).any(|j| (y.data[j] - y2.data[j]).abs() > 1e-6);
        assert!(row0_changed);
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(6);
        let d = 6;
        let t = 3;
        let mut x = Tensor::new(randn_init(t * d, 0.7, &mut rng), vec![t, d]);
        let qkv_w = Tensor::new(randn_init(d * 3 * d, 0.3, &mut rng), vec![d, 3 * d]);
        let qkv_b = Tensor::new(randn_init(3 * d, 0.1, &mut rng), vec![3 * d]);
        let proj_w = Tensor::new(randn_init(d * d, 0.3, &mut rng), vec![d, d]);
        let proj_b = Tensor::new(randn_init(d, 0.1, &mut rng), vec![d]);

        let fwd = |x: &Tensor, rng: &mut StdRng| {
            attention_forward(x, &qkv_w, &qkv_b, &proj_w, &proj_b, 3, 0.0, 0.0, false, rng)
        };

        let (y, cache) = fwd(&x, &mut rng);
        let grads = attention_backward(&y, &qkv_w, &proj_w, &cache, 3);

        let eps = 1e-3;
        for i in 0..x.data.len() {
            x.data[i] += eps;
            let (y_plus, _) = fwd(&x, &mut rng);
            x.data[i] -= 2.0 * eps;
            let (y_minus, _) = fwd(&x, &mut rng);
            x.data[i] += eps;
            let numeric = (loss(&y_plus) - loss(&y_minus)) / (2.0 * eps);
            assert!(
                (grads.x.data[i] - numeric).abs() < 2e-2,
                "entry {}: {} vs {}",
                i,
                grads.x.data[i],
                numeric
            );
        }
    }
}
