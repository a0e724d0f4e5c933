//! Layer Normalization
//!
//! Normalizes each row to zero mean and unit variance, then applies a
//! learned scale (gamma) and shift (beta):
//!
//! ```text
//! x_norm = (x - mean) / √(var + ε)
//! y = γ * x_norm + β
//! ```
//!
//! The backward pass is the subtle part: the mean and variance depend on
//! every element of the row, so each input gradient carries two correction
//! terms besides the direct path:
//!
//! ```text
//! grad_x = (g - E[g] - x_norm * E[g * x_norm]) / √(var + ε)
//! ```
//!
//! where `g = grad_y * γ` and the expectations run over the row.

use crate::tensor::Tensor;

const LN_EPS: f32 = 1e-5;

/// Values a layer-norm backward pass needs from forward.
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row `√(var + ε)`.
    pub std: Vec<f32>,
}

/// Gradients of a layer norm.
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

/// Normalize each row of a 2-D tensor, then scale and shift.
pub fn layer_norm_forward(x: &Tensor, gamma: &Tensor, beta: &Tensor) -> (Tensor, LayerNormCache) {
    let rows = x.shape[0];
    let cols = x.shape[1];

    let mut x_norm = vec![0.0; rows * cols];
    let mut y = vec![0.0; rows * cols];
    let mut std = vec![0.0; rows];

    for i in 0..rows {
        let row = x.row(i);
        let mean: f32 = row.iter().sum::<f32>() / cols as f32;
        let var: f32 = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
        let s = (var + LN_EPS).sqrt();
        std[i] = s;

        for j in 0..cols {
            let xn = (row[j] - mean) / s;
            x_norm[i * cols + j] = xn;
            y[i * cols + j] = gamma.data[j] * xn + beta.data[j];
        }
    }

    (
        Tensor::new(y, x.shape.clone()),
        LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            std,
        },
    )
}

/// Gradients for gamma, beta, and input.
pub fn layer_norm_backward(
    grad_out: &Tensor,
    gamma: &Tensor,
    cache: &LayerNormCache,
) -> LayerNormGradients {
    let rows = grad_out.shape[0];
    let cols = grad_out.shape[1];

    let mut grad_gamma = vec![0.0; cols];
    let mut grad_beta = vec![0.0; cols];
    let mut grad_x = vec![0.0; rows * cols];

    for i in 0..rows {
        let g_row = grad_out.row(i);
        let xn_row = cache.x_norm.row(i);

        for j in 0..cols {
            grad_gamma[j] += g_row[j] * xn_row[j];
            grad_beta[j] += g_row[j];
        }

        // g = grad_y * gamma, then subtract the mean and variance terms.
        let gxn: Vec<f32> = (0..cols).map(|j| g_row[j] * gamma.data[j]).collect();
        let mean_g: f32 = gxn.iter().sum::<f32>() / cols as f32;
        let mean_gx: f32 = gxn
            .iter()
            .zip(xn_row.iter())
            .map(|(g, x)| g * x)
            .sum::<f32>()
            / cols as f32;

        let s = cache.std[i];
        for j in 0..cols {
            grad_x[i * cols + j] = (gxn[j] - mean_g - xn_row[j] * mean_gx) / s;
        }
    }

    LayerNormGradients {
        gamma: Tensor::new(grad_gamma, vec![cols]),
        beta: Tensor::new(grad_beta, vec![cols]),
        x: Tensor::new(grad_x, grad_out.shape.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::randn_init;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn loss(y: &Tensor) -> f32 {
        y.data.iter().map(|v| 0.5 * v * v).sum()
    }

    #[test]
    fn normalized_rows_have_zero_mean_unit_variance() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = Tensor::new(randn_init(24, 2.0, &mut rng), vec![3, 8]);
        let gamma = Tensor::new(vec![1.0; 8], vec![8]);
        let beta = Tensor::new(vec![0.0; 8], vec![8]);

        let (y, _) = layer_norm_forward(&x, &gamma, &beta);
        for i in 0..3 {
            let row = y.row(i);
            let mean: f32 = row.iter().sum::<f32>() / 8.0;
            let var: f32 = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut x = Tensor::new(randn_init(12, 1.0, &mut rng), vec![2, 6]);
        let gamma = Tensor::new(randn_init(6, 0.5, &mut rng), vec![6]);
        let beta = Tensor::new(randn_init(6, 0.5, &mut rng), vec![6]);

        let (y, cache) = layer_norm_forward(&x, &gamma, &beta);
        let grads = layer_norm_backward(&y, &gamma, &cache);

        let eps = 1e-3;
        for i in 0..x.data.len() {
            x.data[i] += eps;
            let (y_plus, _) = layer_norm_forward(&x, &gamma, &beta);
            x.data[i] -= 2.0 * eps;
            let (y_minus, _) = layer_norm_forward(&x, &gamma, &beta);
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
