//! Text Encoder Interface
//!
//! Tokenization is a collaborator, not a concern of this crate: callers bring
//! their own byte-pair encoder behind the [`TextEncoder`] trait. The trait
//! captures exactly what fine-tuning needs from it.
//!
//! The contract: ids `0..vocab_size()` cover ordinary tokens *and* the
//! special tokens (start, delimiter, classify) appended at the end of the
//! vocabulary; id 0 doubles as padding in formatted batches; and every
//! sequence returned by [`encode_for_classification`] already ends with the
//! classify token and is no longer than the requested maximum.
//!
//! [`encode_for_classification`]: TextEncoder::encode_for_classification

/// A byte-pair encoder as seen by the fine-tuning pipeline.
pub trait TextEncoder: Send + Sync {
    /// Encode texts for classification: each result is wrapped in the
    /// special tokens (ending with the classify token) and truncated to
    /// `max_length` ids.
    fn encode_for_classification(&self, texts: &[String], max_length: usize) -> Vec<Vec<usize>>;

    /// Total vocabulary size, special tokens included.
    fn vocab_size(&self) -> usize;

    /// How many special tokens sit at the end of the vocabulary.
    fn special_tokens(&self) -> usize;

    /// The id of the classify token that terminates every sequence. The
    /// model pools the hidden state at this token's first occurrence.
    fn classify_token(&self) -> usize;
}
