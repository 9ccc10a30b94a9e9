//! Truncated-Normal policy over the continuous split coordinate.
//!
//! ```text
//! features ─► Linear(F, 200) ─► ReLU ─┬─► Linear(200, 1) ─► sigmoid  ─► mean  ∈ (0, 1)
//!                                     └─► Linear(200, 1) ─► softplus ─► scale ∈ (0, ∞)
//!
//! Normal(mean, scale) truncated to [lower_lim, upper_lim]
//! ```
//!
//! Bounds are given per sample in normalised image coordinates.

use tch::{nn, nn::Module, Kind, Tensor};

use crate::config::PolicyConfig;
use crate::distributions::{Normal, TruncatedNormal};
use crate::error::{PolicyError, PolicyResult};

// ---------------------------------------------------------------------------
// SplitBounds
// ---------------------------------------------------------------------------

/// Per-sample interval `[lower, upper]` the split is restricted to.
pub struct SplitBounds {
    lower: Tensor,
    upper: Tensor,
}

impl SplitBounds {
    /// Validate and wrap a pair of `[B, 1]` tensors.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::ShapeMismatch`] if the tensors are not `[B, 1]` or
    ///   disagree in batch size.
    /// - [`PolicyError::InvalidSplitBounds`] if any row has `lower >= upper`.
    pub fn new(lower: &Tensor, upper: &Tensor) -> PolicyResult<Self> {
        let batch = lower.size().first().copied().unwrap_or(0);
        for (name, t) in [("lower_lim", lower), ("upper_lim", upper)] {
            if t.size() != [batch, 1] {
                return Err(PolicyError::shape_mismatch(name, vec![batch, 1], t.size()));
            }
        }

        let bad = lower.ge_tensor(upper).view([-1]).nonzero().view([-1]);
        if bad.size()[0] > 0 {
            let rows = (0..bad.size()[0]).map(|i| bad.int64_value(&[i])).collect();
            return Err(PolicyError::InvalidSplitBounds { rows });
        }

        Ok(SplitBounds {
            lower: lower.to_kind(Kind::Float),
            upper: upper.to_kind(Kind::Float),
        })
    }

    /// The full unit interval `[0, 1]` for `batch` rows.
    pub fn unit(batch: i64, device: tch::Device) -> Self {
        SplitBounds {
            lower: Tensor::zeros([batch, 1], (Kind::Float, device)),
            upper: Tensor::ones([batch, 1], (Kind::Float, device)),
        }
    }

    /// Batch size.
    pub fn batch(&self) -> i64 {
        self.lower.size()[0]
    }

    /// Lower bounds: `[B, 1]`.
    pub fn lower(&self) -> &Tensor {
        &self.lower
    }

    /// Upper bounds: `[B, 1]`.
    pub fn upper(&self) -> &Tensor {
        &self.upper
    }

    /// Move both bounds to `device`.
    pub fn to_device(&self, device: tch::Device) -> Self {
        SplitBounds { lower: self.lower.to_device(device), upper: self.upper.to_device(device) }
    }
}

// ---------------------------------------------------------------------------
// SplitHead
// ---------------------------------------------------------------------------

/// Mean and scale of the split distribution for one batch.
pub struct SplitParams {
    /// Sigmoid-bounded mean: `[B, 1]`.
    pub mean: Tensor,
    /// Softplus-bounded standard deviation: `[B, 1]`.
    pub scale: Tensor,
}

impl SplitParams {
    /// Untruncated `Normal(mean, scale)`.
    pub fn normal(&self) -> Normal {
        Normal::new(&self.mean, &self.scale)
    }
}

/// Dense head parameterising a truncated Normal over the split coordinate.
#[derive(Debug)]
pub struct SplitHead {
    hidden: nn::Linear,
    mean: nn::Linear,
    scale: nn::Linear,
    scale_correction: bool,
}

impl SplitHead {
    /// Register `fc6`, `mean` and `scale` under `path`.
    pub fn new(path: &nn::Path, feature_len: i64, config: &PolicyConfig) -> Self {
        let hidden_units = config.split_hidden_units as i64;
        SplitHead {
            hidden: nn::linear(path / "fc6", feature_len, hidden_units, Default::default()),
            mean: nn::linear(path / "mean", hidden_units, 1, Default::default()),
            scale: nn::linear(path / "scale", hidden_units, 1, Default::default()),
            scale_correction: config.split_scale_correction,
        }
    }

    /// Compute mean and scale from trunk features (`[B, F]`).
    pub fn params(&self, features: &Tensor) -> SplitParams {
        let h = self.hidden.forward(features).relu();
        SplitParams {
            mean: self.mean.forward(&h).sigmoid(),
            scale: self.scale.forward(&h).softplus(),
        }
    }

    /// Truncate `params` to `bounds`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::ShapeMismatch`] if `bounds` has a different
    /// batch size from `params`.
    pub fn distribution(&self, params: &SplitParams, bounds: &SplitBounds) -> PolicyResult<TruncatedNormal> {
        let batch = params.mean.size()[0];
        if bounds.batch() != batch {
            return Err(PolicyError::shape_mismatch(
                "split_bounds",
                vec![batch, 1],
                bounds.lower().size(),
            ));
        }
        Ok(TruncatedNormal::new(
            params.normal(),
            bounds.lower(),
            bounds.upper(),
            self.scale_correction,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
