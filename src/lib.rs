//! Viola: Transformer Fine-Tuning for Text Classification
//!
//! A from-scratch implementation of the "improving language understanding
//! by generative pre-training" fine-tuning recipe: a pretrained post-norm
//! transformer trunk with tied token embeddings, a small classifier head
//! pooled at a designated classification token, and an auxiliary
//! language-modeling loss that keeps the trunk honest while the head
//! learns. Named after Shakespeare's shipwrecked heroine from *Twelfth
//! Night*, who made a new role for herself out of what she already was.
//!
//! Everything runs on the CPU over plain `f32` buffers, with rayon
//! supplying both intra-op parallelism (blocked matrix multiplies) and
//! data parallelism (batch shards with averaged gradients). Forward and
//! backward passes are written out by hand, layer by layer.
//!
//! # Quick start
//!
//! ```no_run
//! use viola::{Config, LanguageModelClassifier, PretrainedSource, TextEncoder};
//! # struct ByteEncoder;
//! # impl TextEncoder for ByteEncoder {
//! #     fn encode_for_classification(&self, texts: &[String], max_length: usize) -> Vec<Vec<usize>> { vec![] }
//! #     fn vocab_size(&self) -> usize { 259 }
//! #     fn special_tokens(&self) -> usize { 3 }
//! #     fn classify_token(&self) -> usize { 258 }
//! # }
//!
//! # fn main() -> viola::Result<()> {
//! let config = Config::default();
//! let mut clf = LanguageModelClassifier::new(config, ByteEncoder)?
//!     .with_pretrained(PretrainedSource::new("model/"))
//!     .with_log("training.csv")?;
//!
//! let texts = vec!["an unalloyed delight".to_string()];
//! let labels = vec![1];
//! let data = clf.finetune(&texts, &labels)?;
//! for range in clf.batches(&data) {
//!     let metrics = clf.train_step(&data, range)?;
//!     println!("step {} clf loss {:.4}", metrics.step, metrics.clf_loss);
//! }
//!
//! let predictions = clf.predict(&texts);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod encoder;
pub mod error;
pub mod formatter;
pub mod layers;
pub mod loader;
pub mod logger;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod trainer;

pub use classifier::{FinetuneData, LanguageModelClassifier, Prediction, StepMetrics};
pub use config::Config;
pub use encoder::TextEncoder;
pub use error::{FinetuneError, Result};
pub use formatter::{array_format, InputBatch};
pub use loader::{load_pretrained, PretrainedSource};
pub use logger::TrainingLogger;
pub use model::{Gradients, Parameters, TransformerClassifier};
pub use optimizer::{AdamWeightDecay, LrSchedule};
pub use tensor::Tensor;
pub use trainer::{DeviceParallelTrainer, StepOutput};
