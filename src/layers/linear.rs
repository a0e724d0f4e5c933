//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b` with its backward pass:
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! The weight gradient exists because W[i,j] touches output column j through
//! input column i of every row; the bias gradient sums because b[j] touches
//! every row equally; grad_x is what the previous layer receives.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// Gaussian initialization: `N(0, stddev²)` samples from a seeded generator.
pub fn randn_init(size: usize, stddev: f32, rng: &mut StdRng) -> Vec<f32> {
    (0..size)
        .map(|_| {
            let v: f32 = rng.sample(StandardNormal);
            v * stddev
        })
        .collect()
}

/// Values a linear backward pass needs from forward.
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients of a linear layer.
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Tensor,
    /// Gradient to pass to the previous layer.
    pub x: Tensor,
}

/// `y = x @ W + b`, caching `x` for backward.
pub fn linear_forward(x: &Tensor, weight: &Tensor, bias: &Tensor) -> (Tensor, LinearCache) {
    let y = x.matmul(weight).add(bias);
    (y, LinearCache { x: x.clone() })
}

/// Gradients for weight, bias, and input.
pub fn linear_backward(grad_out: &Tensor, weight: &Tensor, cache: &LinearCache) -> LinearGradients {
    let grad_weight = cache.x.matmul_transpose_a(grad_out);

    let out_features = grad_out.shape[1];
    let mut grad_bias = vec![0.0; out_features];
    for row in 0..grad_out.shape[0] {
        for (j, g) in grad_bias.iter_mut().enumerate() {
            *g += grad_out.data[row * out_features + j];
        }
    }

    let grad_x = grad_out.matmul_transpose_b(weight);

    LinearGradients {
        weight: grad_weight,
        bias: Tensor::new(grad_bias, vec![out_features]),
        x: grad_x,
    }
}
