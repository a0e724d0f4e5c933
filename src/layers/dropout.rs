//! Dropout
//!
//! Randomly zeros activations during training, scaling the survivors by
//! `1/(1-rate)` so the expected activation is unchanged. In evaluation mode
//! values pass through untouched.
//!
//! Unlike the usual thread-local RNG convenience, every draw comes from a
//! caller-supplied seeded generator: training runs must be reproducible from
//! the configured seed alone, and the device-parallel trainer hands each
//! shard its own deterministic stream.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Mask and scale recorded by a forward pass, replayed in backward.
pub struct DropoutCache {
    /// Per-element keep mask; `None` when dropout was disabled.
    pub mask: Option<Vec<bool>>,
    /// Scaling factor applied to kept values.
    pub scale: f32,
}

/// Apply dropout to a tensor.
pub fn dropout_forward(
    x: &Tensor,
    rate: f32,
    training: bool,
    rng: &mut StdRng,
) -> (Tensor, DropoutCache) {
    if !training || rate == 0.0 {
        let cache = DropoutCache {
            mask: None,
            scale: 1.0,
        };
        return (x.clone(), cache);
    }

    if rate >= 1.0 {
        let cache = DropoutCache {
            mask: Some(vec![false; x.data.len()]),
            scale: 1.0,
        };
        return (Tensor::zeros(x.shape.clone()), cache);
    }

    let scale = 1.0 / (1.0 - rate);
    let mut mask = Vec::with_capacity(x.data.len());
    let mut output = Tensor::zeros(x.shape.clone());

    for i in 0..x.data.len() {
        let keep = rng.gen::<f32>() > rate;
        mask.push(keep);
        if keep {
            output.data[i] = x.data[i] * scale;
        }
    }

    (output, DropoutCache { mask: Some(mask), scale })
}

/// Replay the forward mask on the incoming gradient.
pub fn dropout_backward(grad_out: &Tensor, cache: &DropoutCache) -> Tensor {
    if let Some(mask) = &cache.mask {
        let mut grad_in = Tensor::zeros(grad_out.shape.clone());
        for (i, &keep) in mask.iter().enumerate() {
            if keep {
                grad_in.data[i] = grad_out.data[i] * cache.scale;
            }
        }
        grad_in
    } else {
        grad_out.clone()
    }
}
