//! Training Metrics Logging
//!
//! Appends one CSV row per optimizer step and mirrors it to the `log` facade
//! so progress is visible on the console of whatever subscriber the binary
//! installs. The file is flushed after every row; fine-tuning runs are short
//! enough that losing buffered rows to a crash would be the bigger cost.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

/// CSV logger for per-step training metrics.
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create (or truncate) the CSV file and write the header row.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut log_file = File::create(path)?;
        writeln!(
            log_file,
            "step,elapsed_seconds,learning_rate,clf_loss,lm_loss,grad_norm"
        )?;
        Ok(TrainingLogger {
            log_file,
            start_time: Instant::now(),
        })
    }

    /// Record one optimizer step.
    pub fn log(
        &mut self,
        step: usize,
        lr: f32,
        clf_loss: f32,
        lm_loss: f32,
        grad_norm: f32,
    ) -> io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        writeln!(
            self.log_file,
            "{},{:.3},{:.8},{:.6},{:.6},{:.6}",
            step, elapsed, lr, clf_loss, lm_loss, grad_norm
        )?;
        self.log_file.flush()?;

        log::info!(
            "step {:>5} | lr {:.2e} | clf {:.4} | lm {:.4} | grad norm {:.3}",
            step,
            lr,
            clf_loss,
            lm_loss,
            grad_norm
        );
        Ok(())
    }
}
