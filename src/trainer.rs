//! Device-Parallel Training Step
//!
//! Splits a batch into `n_device` contiguous shards and runs forward and
//! backward for each shard on its own worker, all reading the same shared
//! parameters. Shard gradients are averaged element-wise afterwards.
//!
//! Each shard derives its own random stream from `base_seed + shard index`,
//! so a run is reproducible for a fixed seed and device count, and per-shard
//! losses are normalized by shard size so the mean of shard means equals the
//! full-batch mean.

use crate::error::{FinetuneError, Result};
use crate::formatter::InputBatch;
use crate::model::{ForwardOutput, Gradients, TransformerClassifier};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::ops::Range;

/// Everything one training step produces before the optimizer runs.
#[derive(Debug)]
pub struct StepOutput {
    /// `[n, 2]` classifier logits in batch order.
    pub clf_logits: Tensor,
    pub clf_losses: Vec<f32>,
    pub lm_losses: Vec<f32>,
    /// Shard-averaged gradients.
    pub grads: Gradients,
}

/// Runs forward/backward across equal contiguous shards of a batch.
pub struct DeviceParallelTrainer {
    n_device: usize,
}

impl DeviceParallelTrainer {
    pub fn new(n_device: usize) -> Self {
        DeviceParallelTrainer {
            n_device: n_device.max(1),
        }
    }

    pub fn n_device(&self) -> usize {
        self.n_device
    }

    /// One forward/backward over `range`, sharded `n_device` ways.
    pub fn run(
        &self,
        model: &TransformerClassifier,
        x: &InputBatch,
        m: &Tensor,
        y: &[usize],
        range: Range<usize>,
        base_seed: u64,
    ) -> Result<StepOutput> {
        let n = range.len();
        if n % self.n_device != 0 {
            return Err(FinetuneError::BatchNotDivisible {
                n_examples: n,
                n_device: self.n_device,
            });
        }
        let shard_size = n / self.n_device;

        let shards: Vec<(ForwardOutput, Gradients)> = (0..self.n_device)
            .into_par_iter()
            .map(|k| {
                let start = range.start + k * shard_size;
                let mut rng = StdRng::seed_from_u64(base_seed + k as u64);
                let (out, cache) =
                    model.forward(x, m, y, start..start + shard_size, true, &mut rng);
                let grads = model.backward(&cache);
                (out, grads)
            })
            .collect();

        let mut clf_logits = Tensor::zeros(vec![n, 2]);
        let mut clf_losses = Vec::with_capacity(n);
        let mut lm_losses = Vec::with_capacity(n);
        let mut grads: Option<Gradients> = None;

        for (k, (out, shard_grads)) in shards.into_iter().enumerate() {
            let offset = k * shard_size;
            clf_logits.data[offset * 2..(offset + shard_size) * 2]
                .copy_from_slice(&out.clf_logits.data);
            clf_losses.extend(out.clf_losses);
            lm_losses.extend(out.lm_losses);
            match &mut grads {
                None => grads = Some(shard_grads),
                Some(acc) => acc.accumulate(&shard_grads),
            }
        }

        let mut grads = match grads {
            Some(g) => g,
            None => Gradients::zeros(&model.params),
        };
        grads.scale(1.0 / self.n_device as f32);

        Ok(StepOutput {
            clf_logits,
            clf_losses,
            lm_losses,
            grads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::formatter::array_format;

    #[test]
    fn rejects_batches_that_do_not_shard_evenly() {
        let mut config = Config::tiny();
        config.n_device = 3;
        let mut rng = StdRng::seed_from_u64(1);
        let model = TransformerClassifier::new(config, 20, 5, &mut rng).unwrap();
        let (x, m) = array_format(&[vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8]], 8, 20);
        let trainer = DeviceParallelTrainer::new(3);
        let err = trainer.run(&model, &x, &m, &[0, 1, 0, 1], 0..4, 7).unwrap_err();
        assert!(matches!(
            err,
            FinetuneError::BatchNotDivisible {
                n_examples: 4,
                n_device: 3
            }
        ));
    }

    #[test]
    fn shard_outputs_keep_batch_order() {
        let config = Config::tiny();
        let mut rng = StdRng::seed_from_u64(2);
        let model = TransformerClassifier::new(config, 20, 5, &mut rng).unwrap();
        let seqs = vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8, 9], vec![10, 11]];
        let (x, m) = array_format(&seqs, 8, 20);
        let y = vec![0, 1, 1, 0];

        let trainer = DeviceParallelTrainer::new(2);
        let out = trainer.run(&model, &x, &m, &y, 0..4, 7).unwrap();

        // Dropout is zeroed in the tiny config, so a 1-shard run must agree.
        let single = DeviceParallelTrainer::new(1)
            .run(&model, &x, &m, &y, 0..4, 7)
            .unwrap();
        for i in 0..out.clf_logits.data.len() {
            assert!((out.clf_logits.data[i] - single.clf_logits.data[i]).abs() < 1e-5);
        }
        for i in 0..4 {
            assert!((out.clf_losses[i] - single.clf_losses[i]).abs() < 1e-5);
            assert!((out.lm_losses[i] - single.lm_losses[i]).abs() < 1e-5);
        }
    }
}
