//! Error Types
//!
//! Every failure the crate can surface is a `FinetuneError`. Configuration
//! mismatches (wrong shapes, a batch that cannot be split across devices, a
//! context longer than the pretrained positional table) are fatal and returned
//! before any training step runs. IO and JSON errors from the loader and
//! checkpoint paths wrap the underlying error.
//!
//! Gradient explosion is never an error: it is handled by clipping in the
//! optimizer. Over-length sequences are never an error either: the encoder
//! truncates before the formatter sees them.

use thiserror::Error;

/// Errors raised while building, loading, or training a classifier.
#[derive(Debug, Error)]
pub enum FinetuneError {
    /// A pretrained or checkpointed tensor does not match the live parameter.
    #[error("parameter {index} ({name}) has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// The flat archive holds a different number of values than the shape
    /// manifest describes.
    #[error("pretrained archive holds {found} values but the manifest describes {expected}")]
    ManifestMismatch { expected: usize, found: usize },

    /// The manifest describes a different number of variables than the model
    /// has transformer parameters.
    #[error("pretrained archive holds {found} variables but the model expects {expected}")]
    VariableCount { expected: usize, found: usize },

    /// A batch cannot be split into equal contiguous shards.
    #[error("batch of {n_examples} examples cannot be split across {n_device} devices")]
    BatchNotDivisible { n_examples: usize, n_device: usize },

    /// The configured context exceeds the pretrained positional table.
    #[error("configured context of {max_length} exceeds the pretrained positional table ({available} rows)")]
    ContextTooLong { max_length: usize, available: usize },

    /// The embedding width does not divide evenly across attention heads.
    #[error("embedding width {n_embd} is not divisible by {n_head} heads")]
    EmbedDimNotDivisible { n_embd: usize, n_head: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FinetuneError>;
