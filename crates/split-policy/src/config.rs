//! Network and training configuration.
//!
//! [`PolicyConfig`] holds every hyper-parameter of the rule/split policy: the
//! trunk geometry, head widths, optimiser settings, degenerate-input policy,
//! and the checkpoint / log directories. It is serializable via [`serde`] so
//! it can be stored next to checkpoints as JSON.
//!
//! # Example
//!
//! ```rust
//! use split_policy::config::PolicyConfig;
//!
//! let cfg = PolicyConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.num_rules, 4);
//! assert_eq!(cfg.conv_strides(), vec![1, 1, 1, 2, 2, 2, 2]);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Gradient-descent algorithm applied after per-parameter clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with default betas.
    Adam,
    /// Plain stochastic gradient descent (no momentum).
    Sgd,
}

/// What the rule head does with a mask row that allows no rule at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyMaskPolicy {
    /// Return [`crate::error::PolicyError::EmptyRuleMask`].
    Reject,
    /// Assign probability `1 / num_rules` to every rule in that row.
    Uniform,
}

// ---------------------------------------------------------------------------
// PolicyConfig
// ---------------------------------------------------------------------------

/// Complete configuration for building and training a policy network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------
    /// Side length of the square input image (H = W). Default: **256**.
    pub image_size: usize,

    /// Number of image channels. Default: **1**.
    pub num_channels: usize,

    // -----------------------------------------------------------------------
    // Feature trunk
    // -----------------------------------------------------------------------
    /// Number of convolutional layers. Default: **7**.
    pub num_conv_layers: usize,

    /// Square kernel size shared by every conv layer. Default: **3**.
    pub conv_kernel_size: usize,

    /// Filter count shared by every conv layer. Default: **20**.
    pub conv_filters: usize,

    /// Leading conv layers that keep stride 1; the rest use stride 2.
    /// Default: **3**.
    pub stride_one_layers: usize,

    // -----------------------------------------------------------------------
    // Heads
    // -----------------------------------------------------------------------
    /// Hidden width of the rule head. Default: **200**.
    pub rule_hidden_units: usize,

    /// Number of discrete rules. Default: **4**.
    pub num_rules: usize,

    /// Hidden width of the split head. Default: **200**.
    pub split_hidden_units: usize,

    /// Behaviour for mask rows that allow no rule. Default: **Reject**.
    pub empty_mask_policy: EmptyMaskPolicy,

    /// Subtract `log(scale)` a second time in the truncated log-likelihood.
    /// Default: **true**.
    pub split_scale_correction: bool,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Optimiser. Default: **Adam**.
    pub optimizer: OptimizerKind,

    /// Fixed learning rate. Default: **1e-4**.
    pub learning_rate: f64,

    /// Per-parameter gradient L2-norm ceiling. Default: **10.0**.
    pub grad_clip_norm: f64,

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------
    /// Directory where checkpoints are written. Default: `saved_models`.
    pub checkpoint_dir: PathBuf,

    /// Directory where scalar summaries are written. Default: `train_logging`.
    pub log_dir: PathBuf,

    // -----------------------------------------------------------------------
    // Device / reproducibility
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    /// Seed for parameter initialisation and sampling. Default: **42**.
    pub seed: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            image_size: 256,
            num_channels: 1,
            num_conv_layers: 7,
            conv_kernel_size: 3,
            conv_filters: 20,
            stride_one_layers: 3,
            rule_hidden_units: 200,
            num_rules: 4,
            split_hidden_units: 200,
            empty_mask_policy: EmptyMaskPolicy::Reject,
            split_scale_correction: true,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-4,
            grad_clip_norm: 10.0,
            checkpoint_dir: PathBuf::from("saved_models"),
            log_dir: PathBuf::from("train_logging"),
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
        }
    }
}

impl PolicyConfig {
    /// Load a [`PolicyConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileAccess`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: PolicyConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this configuration as pretty-printed JSON, creating parent
    /// directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileAccess {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Stride of every conv layer: 1 for the first `stride_one_layers`, 2 after.
    pub fn conv_strides(&self) -> Vec<usize> {
        (0..self.num_conv_layers)
            .map(|i| if i < self.stride_one_layers { 1 } else { 2 })
            .collect()
    }

    /// Spatial side length after the whole conv stack with "valid" padding,
    /// or `None` if some layer would produce an empty feature map.
    pub fn trunk_output_size(&self) -> Option<usize> {
        let k = self.conv_kernel_size;
        self.conv_strides().into_iter().try_fold(self.image_size, |size, stride| {
            if size < k {
                None
            } else {
                Some((size - k) / stride + 1)
            }
        })
    }

    /// Length of the flattened feature vector produced by the trunk.
    pub fn feature_len(&self) -> Option<usize> {
        self.trunk_output_size()
            .map(|s| s * s * self.conv_filters)
    }

    /// Validate all fields and return the first problem found.
    ///
    /// # Validated invariants
    ///
    /// - Image size, channel count and every layer width must be non-zero.
    /// - `stride_one_layers` must not exceed `num_conv_layers`.
    /// - The conv stack must leave at least one output pixel.
    /// - `num_rules` must be at least 2.
    /// - `learning_rate` and `grad_clip_norm` must be finite and positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size == 0 {
            return Err(ConfigError::invalid_value("image_size", "must be > 0"));
        }
        if self.num_channels == 0 {
            return Err(ConfigError::invalid_value("num_channels", "must be > 0"));
        }

        // Trunk
        if self.num_conv_layers == 0 {
            return Err(ConfigError::invalid_value("num_conv_layers", "must be > 0"));
        }
        if self.conv_kernel_size == 0 {
            return Err(ConfigError::invalid_value("conv_kernel_size", "must be > 0"));
        }
        if self.conv_filters == 0 {
            return Err(ConfigError::invalid_value("conv_filters", "must be > 0"));
        }
        if self.stride_one_layers > self.num_conv_layers {
            return Err(ConfigError::invalid_value(
                "stride_one_layers",
                "must be <= num_conv_layers",
            ));
        }
        if self.trunk_output_size().map_or(true, |s| s == 0) {
            return Err(ConfigError::invalid_value(
                "image_size",
                format!(
                    "{}px is too small for {} conv layers of kernel {}",
                    self.image_size, self.num_conv_layers, self.conv_kernel_size
                ),
            ));
        }

        // Heads
        if self.rule_hidden_units == 0 {
            return Err(ConfigError::invalid_value("rule_hidden_units", "must be > 0"));
        }
        if self.num_rules < 2 {
            return Err(ConfigError::invalid_value("num_rules", "must be >= 2"));
        }
        if self.split_hidden_units == 0 {
            return Err(ConfigError::invalid_value("split_hidden_units", "must be > 0"));
        }

        // Optimisation
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value("learning_rate", "must be finite and > 0.0"));
        }
        if !(self.grad_clip_norm.is_finite() && self.grad_clip_norm > 0.0) {
            return Err(ConfigError::invalid_value("grad_clip_norm", "must be finite and > 0.0"));
        }

        Ok(())
    }

    /// Device selected by `use_gpu` / `gpu_device_id`, falling back to CPU
    /// when CUDA is unavailable.
    #[cfg(feature = "tch-backend")]
    pub fn device(&self) -> tch::Device {
        if self.use_gpu && tch::Cuda::is_available() {
            tch::Device::Cuda(self.gpu_device_id)
        } else {
            tch::Device::Cpu
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
