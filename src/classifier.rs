//! High-Level Fine-Tuning API
//!
//! [`LanguageModelClassifier`] ties the pieces together: an encoder turns
//! raw text into token ids, the formatter packs them into the two-channel
//! batch layout, the pretrained loader seeds the trunk, and repeated calls
//! to [`train_step`](LanguageModelClassifier::train_step) run the
//! device-parallel forward/backward and the optimizer update. Checkpoints
//! capture the configuration and every parameter tensor in one file.

use crate::config::Config;
use crate::encoder::TextEncoder;
use crate::error::{FinetuneError, Result};
use crate::formatter::{array_format, InputBatch};
use crate::loader::{load_pretrained, read_tensor, write_tensor, PretrainedSource};
use crate::logger::TrainingLogger;
use crate::model::{Parameters, TransformerClassifier};
use crate::optimizer::AdamWeightDecay;
use crate::tensor::Tensor;
use crate::trainer::DeviceParallelTrainer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;

const CHECKPOINT_MAGIC: &[u8; 10] = b"VIOLA_CKPT";
const CHECKPOINT_VERSION: u8 = 1;

/// A formatted training set: inputs, LM mask, and labels.
pub struct FinetuneData {
    pub x: InputBatch,
    pub mask: Tensor,
    pub labels: Vec<usize>,
}

/// Metrics from one optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub step: usize,
    pub lr: f32,
    pub clf_loss: f32,
    pub lm_loss: f32,
    pub grad_norm: f32,
}

/// One classified example.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub label: usize,
    pub probs: [f32; 2],
}

/// A pretrained transformer fine-tuned for binary text classification.
pub struct LanguageModelClassifier<E: TextEncoder> {
    config: Config,
    encoder: E,
    model: TransformerClassifier,
    optimizer: AdamWeightDecay,
    trainer: DeviceParallelTrainer,
    pretrained: Option<PretrainedSource>,
    logger: Option<TrainingLogger>,
    rng: StdRng,
}

impl<E: TextEncoder> LanguageModelClassifier<E> {
    /// Build a classifier with freshly initialized weights.
    pub fn new(config: Config, encoder: E) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = TransformerClassifier::new(
            config.clone(),
            encoder.vocab_size(),
            encoder.classify_token(),
            &mut rng,
        )?;
        let optimizer = AdamWeightDecay::new(&model.params, &config);
        let trainer = DeviceParallelTrainer::new(config.n_device);
        Ok(LanguageModelClassifier {
            config,
            encoder,
            model,
            optimizer,
            trainer,
            pretrained: None,
            logger: None,
            rng,
        })
    }

    /// Load pretrained trunk weights before the first training step.
    pub fn with_pretrained(mut self, source: PretrainedSource) -> Self {
        self.pretrained = Some(source);
        self
    }

    /// Write per-step metrics to a CSV file.
    pub fn with_log<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.logger = Some(TrainingLogger::new(path)?);
        Ok(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn model(&self) -> &TransformerClassifier {
        &self.model
    }

    /// Encode and format a labeled corpus, loading pretrained weights on
    /// first use if a source was configured.
    pub fn finetune(&mut self, texts: &[String], labels: &[usize]) -> Result<FinetuneData> {
        if let Some(source) = self.pretrained.take() {
            load_pretrained(
                &mut self.model.params,
                &self.config,
                &source,
                self.encoder.special_tokens(),
                &mut self.rng,
            )?;
        }

        let sequences = self
            .encoder
            .encode_for_classification(texts, self.config.max_length);
        let (x, mask) = array_format(&sequences, self.config.max_length, self.encoder.vocab_size());
        Ok(FinetuneData {
            x,
            mask,
            labels: labels.to_vec(),
        })
    }

    /// Full batches over the data, in order. A trailing partial batch is
    /// dropped so every step sees the same batch size.
    pub fn batches(&self, data: &FinetuneData) -> Vec<Range<usize>> {
        let n_batch = self.config.n_batch;
        (0..data.x.n / n_batch)
            .map(|i| i * n_batch..(i + 1) * n_batch)
            .collect()
    }

    /// One device-parallel forward/backward and optimizer update.
    pub fn train_step(&mut self, data: &FinetuneData, range: Range<usize>) -> Result<StepMetrics> {
        // A fixed per-step seed block keeps dropout reproducible no matter
        // how many shards the batch is split into.
        let base_seed = self
            .config
            .seed
            .wrapping_add(((self.optimizer.steps() + 1) * self.config.n_device) as u64);

        let out = self
            .trainer
            .run(&self.model, &data.x, &data.mask, &data.labels, range, base_seed)?;

        let grad_norm = self.optimizer.step(&mut self.model.params, &out.grads);
        let step = self.optimizer.steps();
        let lr = self.optimizer.current_lr();

        let n = out.clf_losses.len() as f32;
        let clf_loss = out.clf_losses.iter().sum::<f32>() / n;
        let lm_loss = out.lm_losses.iter().sum::<f32>() / n;

        if let Some(logger) = &mut self.logger {
            logger.log(step, lr, clf_loss, lm_loss, grad_norm)?;
        }

        Ok(StepMetrics {
            step,
            lr,
            clf_loss,
            lm_loss,
            grad_norm,
        })
    }

    /// Classify a batch of texts.
    pub fn predict(&self, texts: &[String]) -> Vec<Prediction> {
        let sequences = self
            .encoder
            .encode_for_classification(texts, self.config.max_length);
        let (x, _) = array_format(&sequences, self.config.max_length, self.encoder.vocab_size());
        let logits = self.model.predict_logits(&x);

        (0..x.n)
            .map(|b| {
                let row = logits.row(b);
                let max = row[0].max(row[1]);
                let e0 = (row[0] - max).exp();
                let e1 = (row[1] - max).exp();
                let sum = e0 + e1;
                Prediction {
                    label: if row[1] > row[0] { 1 } else { 0 },
                    probs: [e0 / sum, e1 / sum],
                }
            })
            .collect()
    }

    /// Save the configuration and every parameter tensor.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(CHECKPOINT_MAGIC)?;
        w.write_all(&[CHECKPOINT_VERSION])?;

        let config_json = serde_json::to_vec(&self.config)?;
        w.write_all(&(config_json.len() as u32).to_le_bytes())?;
        w.write_all(&config_json)?;

        w.write_all(&(self.model.n_vocab() as u32).to_le_bytes())?;
        w.write_all(&(self.model.clf_token() as u32).to_le_bytes())?;

        for tensor in self.model.params.tensors() {
            write_tensor(&mut w, tensor)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Restore a classifier saved with [`save`](Self::save). The optimizer
    /// restarts fresh; only weights and configuration are persisted.
    pub fn load<P: AsRef<Path>>(path: P, encoder: E) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 10];
        r.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a checkpoint file").into());
        }
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported checkpoint version {}", version[0]),
            )
            .into());
        }

        let mut u32_buf = [0u8; 4];
        r.read_exact(&mut u32_buf)?;
        let config_len = u32::from_le_bytes(u32_buf) as usize;
        let mut config_json = vec![0u8; config_len];
        r.read_exact(&mut config_json)?;
        let config: Config = serde_json::from_slice(&config_json)?;

        r.read_exact(&mut u32_buf)?;
        let n_vocab = u32::from_le_bytes(u32_buf) as usize;
        r.read_exact(&mut u32_buf)?;
        let clf_token = u32::from_le_bytes(u32_buf) as usize;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut params = Parameters::new(&config, n_vocab, &mut rng);
        let names = params.names();
        for (i, target) in params.tensors_mut().into_iter().enumerate() {
            let tensor = read_tensor(&mut r)?;
            if tensor.shape != target.shape {
                return Err(FinetuneError::ShapeMismatch {
                    index: i,
                    name: names[i].clone(),
                    expected: target.shape.clone(),
                    found: tensor.shape,
                });
            }
            *target = tensor;
        }

        let model = TransformerClassifier::from_parts(config.clone(), n_vocab, clf_token, params)?;
        let optimizer = AdamWeightDecay::new(&model.params, &config);
        let trainer = DeviceParallelTrainer::new(config.n_device);
        Ok(LanguageModelClassifier {
            config,
            encoder,
            model,
            optimizer,
            trainer,
            pretrained: None,
            logger: None,
            rng,
        })
    }
}
