//! Scalar training summaries.
//!
//! One [`ScalarSummaries`] record is produced per training step. A
//! [`SummaryWriter`] appends each record as a JSON line to
//! `<log_dir>/summaries.jsonl` and mirrors it as a `tracing` event.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PolicyResult;

/// File name of the summary log inside the log directory.
pub const SUMMARY_FILE: &str = "summaries.jsonl";

/// Batch means of the quantities monitored during training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarSummaries {
    /// Mean truncated-normal log-likelihood of the sampled splits.
    pub split_log_likelihood: f64,
    /// Mean cross-entropy of the target rules.
    pub rule_cross_entropy: f64,
    /// Mean rule return weight.
    pub reward_weight: f64,
    /// Mean predicted split location.
    pub split_mean: f64,
    /// Mean predicted split scale.
    pub split_variance: f64,
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    step: u64,
    #[serde(flatten)]
    scalars: &'a ScalarSummaries,
}

/// Appends [`ScalarSummaries`] to a JSON-lines file.
pub struct SummaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SummaryWriter {
    /// Open (or create) `<log_dir>/summaries.jsonl` in append mode.
    pub fn create(log_dir: &Path) -> PolicyResult<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(SUMMARY_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(SummaryWriter { path, out: BufWriter::new(file) })
    }

    /// Path of the summary file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record for `step` and flush.
    pub fn write(&mut self, step: u64, scalars: &ScalarSummaries) -> PolicyResult<()> {
        serde_json::to_writer(&mut self.out, &SummaryRecord { step, scalars })?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        info!(
            step,
            split_log_likelihood = scalars.split_log_likelihood,
            rule_cross_entropy = scalars.rule_cross_entropy,
            reward_weight = scalars.reward_weight,
            split_mean = scalars.split_mean,
            split_variance = scalars.split_variance,
            "summary"
        );
        Ok(())
    }
}
