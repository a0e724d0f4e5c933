//! Position-wise Feed-Forward Network
//!
//! Two linear layers with a GELU in between, expanding to 4× the embedding
//! width and projecting back:
//!
//! ```text
//! y = dropout(gelu(x @ W_fc + b_fc) @ W_out + b_out)
//! ```
//!
//! Applied independently at every sequence position.

use super::activation::{gelu_backward, gelu_forward};
use super::dropout::{dropout_backward, dropout_forward, DropoutCache};
use super::linear::{linear_backward, linear_forward, LinearCache};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Values an MLP backward pass needs from forward.
pub struct MlpCache {
    fc_cache: LinearCache,
    /// Pre-GELU activations.
    h: Tensor,
    out_cache: LinearCache,
    resid_cache: DropoutCache,
}

/// Gradients of an MLP.
pub struct MlpGradients {
    pub fc_w: Tensor,
    pub fc_b: Tensor,
    pub out_w: Tensor,
    pub out_b: Tensor,
    /// Gradient to pass to the previous layer.
    pub x: Tensor,
}

/// Expand, activate, project, dropout.
pub fn mlp_forward(
    x: &Tensor,
    fc_w: &Tensor,
    fc_b: &Tensor,
    out_w: &Tensor,
    out_b: &Tensor,
    resid_pdrop: f32,
    training: bool,
    rng: &mut StdRng,
) -> (Tensor, MlpCache) {
    let (h, fc_cache) = linear_forward(x, fc_w, fc_b);
    let a = gelu_forward(&h);
    let (y_proj, out_cache) = linear_forward(&a, out_w, out_b);
    let (y, resid_cache) = dropout_forward(&y_proj, resid_pdrop, training, rng);

    (
        y,
        MlpCache {
            fc_cache,
            h,
            out_cache,
            resid_cache,
        },
    )
}

/// Backward through dropout, the output projection, GELU, and the expansion.
pub fn mlp_backward(
    grad_out: &Tensor,
    fc_w: &Tensor,
    out_w: &Tensor,
    cache: &MlpCache,
) -> MlpGradients {
    let grad_y_proj = dropout_backward(grad_out, &cache.resid_cache);
    let out_grads = linear_backward(&grad_y_proj, out_w, &cache.out_cache);
    let grad_h = gelu_backward(&out_grads.x, &cache.h);
    let fc_grads = linear_backward(&grad_h, fc_w, &cache.fc_cache);

    MlpGradients {
        fc_w: fc_grads.weight,
        fc_b: fc_grads.bias,
        out_w: out_grads.weight,
        out_b: out_grads.bias,
        x: fc_grads.x,
    }
}
