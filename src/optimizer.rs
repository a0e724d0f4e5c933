//! Adam with Weight Decay
//!
//! The fine-tuning optimizer: Adam moments with bias correction, decoupled
//! L2 applied inside the update, a global gradient-norm clip, and a learning
//! rate annealed over the whole run.
//!
//! ```text
//! g      = grad * clip_scale
//! m      = β₁·m + (1-β₁)·g
//! v      = β₂·v + (1-β₂)·g²
//! m̂, v̂  = bias-corrected m, v
//! w     -= lr(t) · (m̂ / (√v̂ + ε) + l2·w)
//! ```
//!
//! Weight decay only touches matrices; vectors (biases, layer-norm gains,
//! and shifts) are exempt unless `vector_l2` is set. Clipping rescales the
//! whole gradient when its global L2 norm exceeds `max_grad_norm`; the
//! gradients themselves are never mutated, and the pre-clip norm is
//! returned for logging.

use crate::config::Config;
use crate::model::{Gradients, Parameters};
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Learning-rate annealing over training progress `x = step / t_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Linear warmup, then flat.
    WarmupConstant,
    /// Linear warmup, then linear decay to zero.
    WarmupLinear,
    /// Linear warmup, then cosine decay to zero.
    WarmupCosine,
}

impl LrSchedule {
    /// Multiplier for progress `x` in `[0, 1]` with a `warmup` fraction.
    pub fn multiplier(self, x: f32, warmup: f32) -> f32 {
        let x = x.max(0.0);
        if warmup > 0.0 && x < warmup {
            return x / warmup;
        }
        match self {
            LrSchedule::WarmupConstant => 1.0,
            LrSchedule::WarmupLinear => (1.0 - x).max(0.0),
            LrSchedule::WarmupCosine => 0.5 * (1.0 + (std::f32::consts::PI * x).cos()),
        }
    }
}

/// Global L2 norm over every gradient tensor.
pub fn global_grad_norm(grads: &Gradients) -> f32 {
    let sum_sq: f32 = grads
        .tensors()
        .into_par_iter()
        .map(|t| t.data.iter().map(|v| v * v).sum::<f32>())
        .sum();
    sum_sq.sqrt()
}

/// Adam with decoupled weight decay, scheduled learning rate, and global
/// gradient clipping.
pub struct AdamWeightDecay {
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    step: usize,
    lr: f32,
    schedule: LrSchedule,
    warmup: f32,
    t_total: usize,
    b1: f32,
    b2: f32,
    e: f32,
    l2: f32,
    vector_l2: bool,
    max_grad_norm: f32,
}

impl AdamWeightDecay {
    /// Moment buffers are allocated to match the model's tensors.
    pub fn new(params: &Parameters, config: &Config) -> Self {
        let m = params
            .tensors()
            .iter()
            .map(|t| Tensor::zeros(t.shape.clone()))
            .collect::<Vec<_>>();
        let v = params
            .tensors()
            .iter()
            .map(|t| Tensor::zeros(t.shape.clone()))
            .collect();
        AdamWeightDecay {
            m,
            v,
            step: 0,
            lr: config.lr,
            schedule: config.lr_schedule,
            warmup: config.lr_warmup,
            t_total: config.n_updates_total,
            b1: config.b1,
            b2: config.b2,
            e: config.e,
            l2: config.l2,
            vector_l2: config.vector_l2,
            max_grad_norm: config.max_grad_norm,
        }
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Scheduled learning rate for the *next* update.
    pub fn current_lr(&self) -> f32 {
        let x = (self.step as f32) / (self.t_total.max(1) as f32);
        self.lr * self.schedule.multiplier(x, self.warmup)
    }

    /// Apply one update in place; returns the pre-clip gradient norm.
    pub fn step(&mut self, params: &mut Parameters, grads: &Gradients) -> f32 {
        let norm = global_grad_norm(grads);
        let clip_scale = if self.max_grad_norm > 0.0 && norm > self.max_grad_norm {
            self.max_grad_norm / norm
        } else {
            1.0
        };

        self.step += 1;
        let x = (self.step as f32) / (self.t_total.max(1) as f32);
        let lr_t = self.lr * self.schedule.multiplier(x, self.warmup);

        let bias_correction1 = 1.0 - self.b1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.b2.powi(self.step as i32);

        let b1 = self.b1;
        let b2 = self.b2;
        let e = self.e;
        let l2 = self.l2;
        let vector_l2 = self.vector_l2;

        for (((param, grad), m), v) in params
            .tensors_mut()
            .into_iter()
            .zip(grads.tensors())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let decay = if param.shape.len() > 1 || vector_l2 {
                l2
            } else {
                0.0
            };

            let update = |((w, g), (m, v)): ((&mut f32, &f32), (&mut f32, &mut f32))| {
                let g = g * clip_scale;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *w -= lr_t * (m_hat / (v_hat.sqrt() + e) + decay * *w);
            };

            if param.data.len() > 1000 {
                param
                    .data
                    .par_iter_mut()
                    .zip(&grad.data)
                    .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                    .for_each(update);
            } else {
                param
                    .data
                    .iter_mut()
                    .zip(&grad.data)
                    .zip(m.data.iter_mut().zip(v.data.iter_mut()))
                    .for_each(update);
            }
        }

        norm
    }
}
