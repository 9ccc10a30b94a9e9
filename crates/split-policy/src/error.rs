//! Error types for the split-policy network.
//!
//! Every module imports its error type from here rather than defining one
//! inline.
//!
//! ## Hierarchy
//!
//! ```text
//! PolicyError (top-level)
//! ├── ConfigError      (config validation / file loading)
//! └── CheckpointError  (checkpoint naming, discovery, I/O)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// PolicyResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type PolicyResult<T> = Result<T, PolicyError>;

// ---------------------------------------------------------------------------
// PolicyError (top-level aggregator)
// ---------------------------------------------------------------------------

/// Top-level error type for the split-policy network.
///
/// Lower-level functions in [`crate::config`] and [`crate::checkpoint`] return
/// their own error types which coerce into `PolicyError` via [`From`].
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A checkpoint could not be written, found, or read.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// An input tensor does not have the shape the network expects.
    #[error("Shape mismatch for `{input}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which input was malformed.
        input: &'static str,
        /// Expected shape (`-1` marks a free batch dimension).
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// At least one row has `lower_lim >= upper_lim`.
    #[error("Split bounds must satisfy lower < upper; violated in rows {rows:?}")]
    InvalidSplitBounds {
        /// Batch rows that violate the ordering.
        rows: Vec<i64>,
    },

    /// At least one row of the rule mask has no valid rule.
    #[error("Rule mask rows {rows:?} allow no rule")]
    EmptyRuleMask {
        /// Batch rows whose mask is all zero.
        rows: Vec<i64>,
    },

    /// The loss or a gradient of a training step was NaN or infinite.
    /// No parameter was updated.
    #[error("Non-finite training step {step}: loss {loss}, {non_finite_grads} non-finite gradients")]
    NonFiniteStep {
        /// Step index the update would have had.
        step: u64,
        /// Total loss of the batch.
        loss: f64,
        /// Number of gradient tensors with a non-finite norm.
        non_finite_grads: usize,
    },

    /// A trainer was stepped with a network other than the one whose
    /// variables its optimiser holds.
    #[error("Trainer was built for a different network ({expected} variables tracked, {actual} given)")]
    TrainerMismatch {
        /// Number of variables the optimiser tracks.
        expected: usize,
        /// Number of trainable variables of the network passed in.
        actual: usize,
    },

    /// The tensor runtime reported an error.
    #[cfg(feature = "tch-backend")]
    #[error("Tensor runtime error: {0}")]
    Torch(#[from] tch::TchError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error without further path context.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    /// Construct a [`PolicyError::ShapeMismatch`].
    pub fn shape_mismatch(input: &'static str, expected: Vec<i64>, actual: Vec<i64>) -> Self {
        PolicyError::ShapeMismatch { input, expected, actual }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`PolicyConfig`].
///
/// [`PolicyConfig`]: crate::config::PolicyConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read or written.
    #[error("Cannot access config file `{path}`: {source}")]
    FileAccess {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors produced while saving, locating, or restoring checkpoints.
///
/// Shape-mismatched variables are *not* errors; they are reported through
/// [`crate::checkpoint::RestoreReport`].
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint directory could not be created or listed.
    #[error("Cannot access checkpoint directory `{path}`: {source}")]
    Directory {
        /// Directory being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint file does not exist.
    #[error("Checkpoint not found at `{path}`")]
    NotFound {
        /// The missing file.
        path: PathBuf,
    },

    /// The tensor runtime failed to serialize or deserialize the archive.
    #[error("Cannot {action} checkpoint `{path}`: {message}")]
    Archive {
        /// `"save"` or `"read"`.
        action: &'static str,
        /// Archive path.
        path: PathBuf,
        /// Runtime error message.
        message: String,
    },
}

impl CheckpointError {
    /// Construct a [`CheckpointError::Archive`].
    pub fn archive<S: Into<String>>(action: &'static str, path: impl Into<PathBuf>, msg: S) -> Self {
        CheckpointError::Archive { action, path: path.into(), message: msg.into() }
    }
}
