//! Versioned checkpoint files and shape-matched restore.
//!
//! Checkpoints are written as named-tensor archives into a single directory:
//!
//! ```text
//! saved_models/
//! ├── model_epoch0_iter500.ot
//! ├── model_epoch0.ot          (end of epoch 0)
//! ├── model_epoch1_iter500.ot
//! └── model_epoch1.ot
//! ```
//!
//! Restoring copies a saved tensor into the live network only when the
//! variable name exists on both sides *and* the shapes agree exactly. Every
//! other variable keeps its freshly initialised value and is listed in the
//! returned [`RestoreReport`], so a network whose architecture changed can
//! still be warm-started from an older checkpoint.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::CheckpointError;

/// File extension of checkpoint archives.
pub const CHECKPOINT_EXTENSION: &str = "ot";

const FILE_PREFIX: &str = "model_epoch";

// ---------------------------------------------------------------------------
// CheckpointId
// ---------------------------------------------------------------------------

/// Epoch / iteration pair identifying a checkpoint file.
///
/// Ordering follows training progress: an epoch-level checkpoint sorts after
/// every iteration checkpoint of the same epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckpointId {
    /// Training epoch.
    pub epoch: usize,
    /// Iteration within the epoch, `None` for an end-of-epoch save.
    pub iteration: Option<usize>,
}

impl CheckpointId {
    /// File name for this id, e.g. `model_epoch3_iter200.ot`.
    pub fn file_name(&self) -> String {
        match self.iteration {
            Some(iter) => format!("{FILE_PREFIX}{}_iter{iter}.{CHECKPOINT_EXTENSION}", self.epoch),
            None => format!("{FILE_PREFIX}{}.{CHECKPOINT_EXTENSION}", self.epoch),
        }
    }

    /// Parse a file name produced by [`CheckpointId::file_name`].
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(FILE_PREFIX)?
            .strip_suffix(CHECKPOINT_EXTENSION)?
            .strip_suffix('.')?;
        let (epoch, iteration) = match stem.split_once("_iter") {
            Some((epoch, iter)) => (epoch, Some(parse_index(iter)?)),
            None => (stem, None),
        };
        Some(CheckpointId { epoch: parse_index(epoch)?, iteration })
    }

    fn sort_key(&self) -> (usize, usize) {
        (self.epoch, self.iteration.map_or(usize::MAX, |i| i))
    }
}

impl PartialOrd for CheckpointId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

fn parse_index(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

// ---------------------------------------------------------------------------
// RestoreReport
// ---------------------------------------------------------------------------

/// A variable present in both the checkpoint and the network whose shapes
/// disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeMismatchEntry {
    /// Variable name, e.g. `rule.logits.weight`.
    pub name: String,
    /// Shape stored in the checkpoint.
    pub saved_shape: Vec<i64>,
    /// Shape of the live variable.
    pub current_shape: Vec<i64>,
}

/// Outcome of a shape-matched restore. All name lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Variables overwritten with the saved value.
    pub restored: Vec<String>,
    /// Variables skipped because the shapes differ.
    pub shape_mismatched: Vec<ShapeMismatchEntry>,
    /// Network variables absent from the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries with no counterpart in the network.
    pub unused: Vec<String>,
}

impl RestoreReport {
    /// `true` when every network variable was restored and nothing in the
    /// checkpoint was left over.
    pub fn is_complete(&self) -> bool {
        self.shape_mismatched.is_empty() && self.missing.is_empty() && self.unused.is_empty()
    }

    /// Number of network variables that kept their initial value.
    pub fn num_skipped(&self) -> usize {
        self.shape_mismatched.len() + self.missing.len()
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Names, discovers, writes, and restores checkpoints in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manage checkpoints under `dir`. The directory is created lazily on the
    /// first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointManager { dir: dir.into() }
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint for `epoch` and optional `iteration`.
    pub fn path_for(&self, epoch: usize, iteration: Option<usize>) -> PathBuf {
        self.dir.join(CheckpointId { epoch, iteration }.file_name())
    }

    /// All checkpoints in the directory, oldest first. A missing directory
    /// yields an empty list.
    pub fn list(&self) -> Result<Vec<(CheckpointId, PathBuf)>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|source| CheckpointError::Directory { path: self.dir.clone(), source })?;

        let mut found = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|source| CheckpointError::Directory { path: self.dir.clone(), source })?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(CheckpointId::parse) {
                found.push((id, entry.path()));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Most recent checkpoint, if any.
    pub fn latest(&self) -> Result<Option<(CheckpointId, PathBuf)>, CheckpointError> {
        Ok(self.list()?.pop())
    }
}

#[cfg(feature = "tch-backend")]
mod archive {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::{Path, PathBuf};

    use tch::{nn, Tensor};
    use tracing::{info, warn};

    use super::{CheckpointManager, RestoreReport, ShapeMismatchEntry};
    use crate::error::CheckpointError;

    impl CheckpointManager {
        /// Write every variable of `vs` to the checkpoint for `epoch` /
        /// `iteration`, creating the directory if needed.
        pub fn save(
            &self,
            vs: &nn::VarStore,
            epoch: usize,
            iteration: Option<usize>,
        ) -> Result<PathBuf, CheckpointError> {
            std::fs::create_dir_all(&self.dir)
                .map_err(|source| CheckpointError::Directory { path: self.dir.clone(), source })?;
            let path = self.path_for(epoch, iteration);
            vs.save(&path)
                .map_err(|e| CheckpointError::archive("save", &path, e.to_string()))?;
            info!(path = %path.display(), epoch, ?iteration, "checkpoint saved");
            Ok(path)
        }

        /// Copy every saved tensor whose name and shape match a variable of
        /// `vs`. Mismatched and unmatched variables are reported, not fatal.
        ///
        /// # Errors
        ///
        /// - [`CheckpointError::NotFound`] if `path` does not exist.
        /// - [`CheckpointError::Archive`] if the archive cannot be read.
        pub fn restore(vs: &mut nn::VarStore, path: &Path) -> Result<RestoreReport, CheckpointError> {
            if !path.exists() {
                return Err(CheckpointError::NotFound { path: path.to_path_buf() });
            }
            let saved: BTreeMap<String, Tensor> = Tensor::load_multi(path)
                .map_err(|e| CheckpointError::archive("read", path, e.to_string()))?
                .into_iter()
                .collect();

            let mut current: BTreeMap<String, Tensor> = vs.variables().into_iter().collect();
            let mut report = RestoreReport::default();

            tch::no_grad(|| -> Result<(), CheckpointError> {
                for (name, var) in current.iter_mut() {
                    let Some(src) = saved.get(name) else {
                        report.missing.push(name.clone());
                        continue;
                    };
                    if src.size() != var.size() {
                        report.shape_mismatched.push(ShapeMismatchEntry {
                            name: name.clone(),
                            saved_shape: src.size(),
                            current_shape: var.size(),
                        });
                        continue;
                    }
                    let src = src.to_device(var.device()).to_kind(var.kind());
                    var.f_copy_(&src)
                        .map_err(|e| CheckpointError::archive("read", path, format!("{name}: {e}")))?;
                    report.restored.push(name.clone());
                }
                Ok(())
            })?;

            let known: BTreeSet<&String> = current.keys().collect();
            report.unused = saved.keys().filter(|k| !known.contains(k)).cloned().collect();

            for entry in &report.shape_mismatched {
                warn!(
                    name = %entry.name,
                    saved = ?entry.saved_shape,
                    current = ?entry.current_shape,
                    "checkpoint variable has a different shape; keeping initial value"
                );
            }
            if !report.missing.is_empty() {
                warn!(names = ?report.missing, "variables not found in checkpoint");
            }
            if !report.unused.is_empty() {
                warn!(names = ?report.unused, "checkpoint entries not used by the network");
            }
            info!(
                path = %path.display(),
                restored = report.restored.len(),
                skipped = report.num_skipped(),
                "checkpoint restored"
            );
            Ok(report)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
