//! Hyperparameter Configuration
//!
//! A single immutable struct carries every knob: architecture, dropout rates,
//! optimizer settings, and the device count for data-parallel training. It is
//! constructed once, up front, and never mutated afterwards - components
//! borrow it rather than reading from any shared mutable state.
//!
//! The defaults reproduce the standard fine-tuning recipe for a 12-layer,
//! 768-wide, 12-head model with a 512-token context.

use serde::{Deserialize, Serialize};

use crate::optimizer::LrSchedule;

/// Every hyperparameter for fine-tuning, in one place.
///
/// The vocabulary size is deliberately absent: it belongs to the encoder and
/// is read from it when the model is built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Context length. Token sequences are padded (or truncated by the
    /// encoder) to exactly this many positions.
    pub max_length: usize,
    /// Examples per training batch.
    pub n_batch: usize,
    /// Number of transformer blocks.
    pub n_layer: usize,
    /// Attention heads per block. Must divide `n_embd`.
    pub n_head: usize,
    /// Embedding width.
    pub n_embd: usize,
    /// Logical devices a batch is split across. Gradients are averaged
    /// over the shards.
    pub n_device: usize,

    /// Dropout on the embedding table.
    pub embd_pdrop: f32,
    /// Dropout on attention weights.
    pub attn_pdrop: f32,
    /// Dropout on residual branches.
    pub resid_pdrop: f32,
    /// Per-example dropout on the pooled classifier input.
    pub clf_pdrop: f32,

    /// Weight of the auxiliary language-modeling loss.
    pub lm_coef: f32,

    /// Peak learning rate.
    pub lr: f32,
    /// Warmup, as a fraction of the total schedule.
    pub lr_warmup: f32,
    /// Learning-rate schedule shape.
    pub lr_schedule: LrSchedule,
    /// Total updates the schedule is stretched over.
    pub n_updates_total: usize,
    /// Adam first-moment decay.
    pub b1: f32,
    /// Adam second-moment decay.
    pub b2: f32,
    /// Adam epsilon.
    pub e: f32,
    /// Decoupled weight-decay coefficient.
    pub l2: f32,
    /// Apply weight decay to 1-D parameters too (biases, layer-norm
    /// scales). Off by default.
    pub vector_l2: bool,
    /// Global gradient-norm ceiling. Non-positive disables clipping.
    pub max_grad_norm: f32,

    /// Seed for every random draw: initialization, dropout, and the
    /// gaussian special-token embeddings.
    pub seed: u64,
    /// Stddev for randomly initialized weights and the special-token rows
    /// spliced into the pretrained embedding table.
    pub weight_stddev: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_length: 512,
            n_batch: 8,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            n_device: 4,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
            clf_pdrop: 0.1,
            lm_coef: 0.5,
            lr: 6.25e-5,
            lr_warmup: 0.002,
            lr_schedule: LrSchedule::WarmupLinear,
            n_updates_total: 1000,
            b1: 0.9,
            b2: 0.999,
            e: 1e-8,
            l2: 0.01,
            vector_l2: false,
            max_grad_norm: 1.0,
            seed: 42,
            weight_stddev: 0.02,
        }
    }
}

impl Config {
    /// A minimal configuration for tests and quick experiments.
    ///
    /// Two 16-wide, 2-head blocks over an 8-token context, dropout disabled
    /// so runs are deterministic.
    pub fn tiny() -> Self {
        Self {
            max_length: 8,
            n_batch: 4,
            n_layer: 2,
            n_head: 2,
            n_embd: 16,
            n_device: 2,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            resid_pdrop: 0.0,
            clf_pdrop: 0.0,
            lm_coef: 0.5,
            lr: 1e-3,
            lr_warmup: 0.1,
            lr_schedule: LrSchedule::WarmupLinear,
            n_updates_total: 100,
            b1: 0.9,
            b2: 0.999,
            e: 1e-8,
            l2: 0.01,
            vector_l2: false,
            max_grad_norm: 1.0,
            seed: 42,
            weight_stddev: 0.02,
        }
    }
}
