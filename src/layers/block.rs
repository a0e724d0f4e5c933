//! Transformer Block
//!
//! One layer of the network: attention and feed-forward sublayers, each
//! wrapped in a residual connection with layer normalization applied *after*
//! the addition (the post-norm arrangement used by the original generation
//! of pretrained transformers):
//!
//! ```text
//! n1 = ln1(x + attention(x))
//! y  = ln2(n1 + mlp(n1))
//! ```
//!
//! Backward mirrors this exactly; each residual fork means the gradient of
//! the sublayer input is added to the gradient flowing around it.

use super::attention::{attention_backward, attention_forward, AttentionCache};
use super::layer_norm::{layer_norm_backward, layer_norm_forward, LayerNormCache};
use super::linear::randn_init;
use super::mlp::{mlp_backward, mlp_forward, MlpCache};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Learnable tensors of one transformer block, in creation order.
pub struct BlockParams {
    pub qkv_w: Tensor,
    pub qkv_b: Tensor,
    pub proj_w: Tensor,
    pub proj_b: Tensor,
    pub ln1_gamma: Tensor,
    pub ln1_beta: Tensor,
    pub fc_w: Tensor,
    pub fc_b: Tensor,
    pub out_w: Tensor,
    pub out_b: Tensor,
    pub ln2_gamma: Tensor,
    pub ln2_beta: Tensor,
}

impl BlockParams {
    /// Fresh block: Gaussian weights, zero biases, identity layer norms.
    pub fn new(n_embd: usize, stddev: f32, rng: &mut StdRng) -> Self {
        let d = n_embd;
        BlockParams {
            qkv_w: Tensor::new(randn_init(d * 3 * d, stddev, rng), vec![d, 3 * d]),
            qkv_b: Tensor::zeros(vec![3 * d]),
            proj_w: Tensor::new(randn_init(d * d, stddev, rng), vec![d, d]),
            proj_b: Tensor::zeros(vec![d]),
            ln1_gamma: Tensor::new(vec![1.0; d], vec![d]),
            ln1_beta: Tensor::zeros(vec![d]),
            fc_w: Tensor::new(randn_init(d * 4 * d, stddev, rng), vec![d, 4 * d]),
            fc_b: Tensor::zeros(vec![4 * d]),
            out_w: Tensor::new(randn_init(4 * d * d, stddev, rng), vec![4 * d, d]),
            out_b: Tensor::zeros(vec![d]),
            ln2_gamma: Tensor::new(vec![1.0; d], vec![d]),
            ln2_beta: Tensor::zeros(vec![d]),
        }
    }

    pub fn tensors(&self) -> Vec<&Tensor> {
        vec![
            &self.qkv_w,
            &self.qkv_b,
            &self.proj_w,
            &self.proj_b,
            &self.ln1_gamma,
            &self.ln1_beta,
            &self.fc_w,
            &self.fc_b,
            &self.out_w,
            &self.out_b,
            &self.ln2_gamma,
            &self.ln2_beta,
        ]
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![
            &mut self.qkv_w,
            &mut self.qkv_b,
            &mut self.proj_w,
            &mut self.proj_b,
            &mut self.ln1_gamma,
            &mut self.ln1_beta,
            &mut self.fc_w,
            &mut self.fc_b,
            &mut self.out_w,
            &mut self.out_b,
            &mut self.ln2_gamma,
            &mut self.ln2_beta,
        ]
    }
}

/// Gradient accumulators matching [`BlockParams`] tensor for tensor.
#[derive(Debug)]
pub struct BlockGrads {
    pub qkv_w: Tensor,
    pub qkv_b: Tensor,
    pub proj_w: Tensor,
    pub proj_b: Tensor,
    pub ln1_gamma: Tensor,
    pub ln1_beta: Tensor,
    pub fc_w: Tensor,
    pub fc_b: Tensor,
    pub out_w: Tensor,
    pub out_b: Tensor,
    pub ln2_gamma: Tensor,
    pub ln2_beta: Tensor,
}

impl BlockGrads {
    pub fn zeros(params: &BlockParams) -> Self {
        BlockGrads {
            qkv_w: Tensor::zeros(params.qkv_w.shape.clone()),
            qkv_b: Tensor::zeros(params.qkv_b.shape.clone()),
            proj_w: Tensor::zeros(params.proj_w.shape.clone()),
            proj_b: Tensor::zeros(params.proj_b.shape.clone()),
            ln1_gamma: Tensor::zeros(params.ln1_gamma.shape.clone()),
            ln1_beta: Tensor::zeros(params.ln1_beta.shape.clone()),
            fc_w: Tensor::zeros(params.fc_w.shape.clone()),
            fc_b: Tensor::zeros(params.fc_b.shape.clone()),
            out_w: Tensor::zeros(params.out_w.shape.clone()),
            out_b: Tensor::zeros(params.out_b.shape.clone()),
            ln2_gamma: Tensor::zeros(params.ln2_gamma.shape.clone()),
            ln2_beta: Tensor::zeros(params.ln2_beta.shape.clone()),
        }
    }

    pub fn tensors(&self) -> Vec<&Tensor> {
        vec![
            &self.qkv_w,
            &self.qkv_b,
            &self.proj_w,
            &self.proj_b,
            &self.ln1_gamma,
            &self.ln1_beta,
            &self.fc_w,
            &self.fc_b,
            &self.out_w,
            &self.out_b,
            &self.ln2_gamma,
            &self.ln2_beta,
        ]
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![
            &mut self.qkv_w,
            &mut self.qkv_b,
            &mut self.proj_w,
            &mut self.proj_b,
            &mut self.ln1_gamma,
            &mut self.ln1_beta,
            &mut self.fc_w,
            &mut self.fc_b,
            &mut self.out_w,
            &mut self.out_b,
            &mut self.ln2_gamma,
            &mut self.ln2_beta,
        ]
    }
}

/// Values a block backward pass needs from forward.
pub struct BlockCache {
    attn_cache: AttentionCache,
    ln1_cache: LayerNormCache,
    mlp_cache: MlpCache,
    ln2_cache: LayerNormCache,
}

/// Post-norm forward: `ln2(n1 + mlp(n1))` where `n1 = ln1(x + attn(x))`.
#[allow(clippy::too_many_arguments)]
pub fn block_forward(
    x: &Tensor,
    p: &BlockParams,
    n_head: usize,
    attn_pdrop: f32,
    resid_pdrop: f32,
    training: bool,
    rng: &mut StdRng,
) -> (Tensor, BlockCache) {
    let (a, attn_cache) = attention_forward(
        x, &p.qkv_w, &p.qkv_b, &p.proj_w, &p.proj_b, n_head, attn_pdrop, resid_pdrop, training, rng,
    );
    let h1 = x.add(&a);
    let (n1, ln1_cache) = layer_norm_forward(&h1, &p.ln1_gamma, &p.ln1_beta);

    let (m, mlp_cache) = mlp_forward(
        &n1, &p.fc_w, &p.fc_b, &p.out_w, &p.out_b, resid_pdrop, training, rng,
    );
    let h2 = n1.add(&m);
    let (y, ln2_cache) = layer_norm_forward(&h2, &p.ln2_gamma, &p.ln2_beta);

    (
        y,
        BlockCache {
            attn_cache,
            ln1_cache,
            mlp_cache,
            ln2_cache,
        },
    )
}

/// Backward through both sublayers; returns the gradient for the block input
/// alongside the parameter gradients.
pub fn block_backward(
    grad_y: &Tensor,
    p: &BlockParams,
    cache: &BlockCache,
    n_head: usize,
) -> (BlockGrads, Tensor) {
    let ln2_grads = layer_norm_backward(grad_y, &p.ln2_gamma, &cache.ln2_cache);
    let grad_h2 = ln2_grads.x;

    let mlp_grads = mlp_backward(&grad_h2, &p.fc_w, &p.out_w, &cache.mlp_cache);
    // n1 feeds both the MLP and the residual path.
    let grad_n1 = grad_h2.add(&mlp_grads.x);

    let ln1_grads = layer_norm_backward(&grad_n1, &p.ln1_gamma, &cache.ln1_cache);
    let grad_h1 = ln1_grads.x;

    let attn_grads = attention_backward(&grad_h1, &p.qkv_w, &p.proj_w, &cache.attn_cache, n_head);
    let grad_x = grad_h1.add(&attn_grads.x);

    let grads = BlockGrads {
        qkv_w: attn_grads.qkv_w,
        qkv_b: attn_grads.qkv_b,
        proj_w: attn_grads.proj_w,
        proj_b: attn_grads.proj_b,
        ln1_gamma: ln1_grads.gamma,
        ln1_beta: ln1_grads.beta,
        fc_w: mlp_grads.fc_w,
        fc_b: mlp_grads.fc_b,
        out_w: mlp_grads.out_w,
        out_b: mlp_grads.out_b,
        ln2_gamma: ln2_grads.gamma,
        ln2_beta: ln2_grads.beta,
    };

    (grads, grad_x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn loss(y: &Tensor) -> f32 {
        y.data.iter().map(|v| 0.5 * v * v).sum()
    }

    #[test]
    fn forward_preserves_shape_and_stays_finite() {
        let mut rng = StdRng::seed_from_u64(31);
        let p = BlockParams::new(8, 0.1, &mut rng);
        let x = Tensor::new(randn_init(5 * 8, 1.0, &mut rng), vec![5, 8]);
        let (y, _) = block_forward(&x, &p, 2, 0.0, 0.0, false, &mut rng);
        assert_eq!(y.shape, vec![5, 8]);
        assert!(y.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(32);
        let p = BlockParams::new(6, 0.2, &mut rng);
        let mut x = Tensor::new(randn_init(3 * 6, 0.8, &mut rng), vec![3, 6]);

        let (y, cache) = block_forward(&x, &p, 3, 0.0, 0.0, false, &mut rng);
        let (_, grad_x) = block_backward(&y, &p, &cache, 3);

        let eps = 1e-2;
        for i in 0..x.data.len() {
            x.data[i] += eps;
            let (y_plus, _) = block_forward(&x, &p, 3, 0.0, 0.0, false, &mut rng);
            x.data[i] -= 2.0 * eps;
            let (y_minus, _) = block_forward(&x, &p, 3, 0.0, 0.0, false, &mut rng);
            x.data[i] += eps;
            let numeric = (loss(&y_plus) - loss(&y_minus)) / (2.0 * eps);
            assert!(
                (grad_x.data[i] - numeric).abs() < 5e-2,
                "entry {}: {} vs {}",
                i,
                grad_x.data[i],
                numeric
            );
        }
    }
}
