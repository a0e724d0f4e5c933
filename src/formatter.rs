//! Token Formatter
//!
//! Turns ragged token sequences into the fixed-shape arrays the model
//! consumes: a two-channel id tensor X of shape `[n, max_length, 2]` and a
//! language-modeling loss mask M of shape `[n, max_length]`.
//!
//! Channel 0 carries the token ids, left-aligned and zero-padded (id 0 is
//! the padding convention). Channel 1 carries positional ids: every row is
//! `vocab_size, vocab_size + 1, ...` so positions index into the tail of the
//! combined embedding table and can never collide with token ids.
//!
//! The mask is 1 exactly at positions `1..L` of each sequence of length L.
//! Position 0 is excluded because a language model has no context to predict
//! the first token from; padding is excluded so it never contributes loss.

use crate::tensor::Tensor;

/// The X tensor: ids for a formatted batch, `[n, max_length, 2]`.
///
/// Stored flat in row-major order. Both channels hold row indices into the
/// combined embedding table.
#[derive(Clone, Debug)]
pub struct InputBatch {
    ids: Vec<usize>,
    /// Number of examples.
    pub n: usize,
    /// Padded sequence length.
    pub max_length: usize,
}

impl InputBatch {
    /// Token id at `[b, t, 0]`. Zero means padding.
    pub fn token(&self, b: usize, t: usize) -> usize {
        self.ids[(b * self.max_length + t) * 2]
    }

    /// Positional id at `[b, t, 1]`.
    pub fn position(&self, b: usize, t: usize) -> usize {
        self.ids[(b * self.max_length + t) * 2 + 1]
    }
}

/// Format token sequences into the two-channel id tensor and LM loss mask.
///
/// `n_vocab` is the encoder's full vocabulary size (special tokens
/// included); positional ids start right after it. Sequences longer than
/// `max_length` are truncated, though the encoder contract means callers
/// normally never hand those in.
pub fn array_format(
    token_seqs: &[Vec<usize>],
    max_length: usize,
    n_vocab: usize,
) -> (InputBatch, Tensor) {
    let n = token_seqs.len();
    let mut ids = vec![0usize; n * max_length * 2];
    let mut mask = vec![0.0f32; n * max_length];

    for (b, seq) in token_seqs.iter().enumerate() {
        let len = seq.len().min(max_length);
        for (t, &tok) in seq.iter().take(len).enumerate() {
            ids[(b * max_length + t) * 2] = tok;
        }
        // Positional channel is filled for every slot, padding included.
        for t in 0..max_length {
            ids[(b * max_length + t) * 2 + 1] = n_vocab + t;
        }
        for t in 1..len {
            mask[b * max_length + t] = 1.0;
        }
    }

    (
        InputBatch { ids, n, max_length },
        Tensor::new(mask, vec![n, max_length]),
    )
}
