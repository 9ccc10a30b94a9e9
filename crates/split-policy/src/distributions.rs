//! Normal and truncated-Normal distributions over `tch` tensors.
//!
//! All parameters are batched `[B, 1]` tensors and every operation is
//! differentiable with respect to `loc` and `scale`.
//!
//! The probability mass of an interval, `Φ(b) − Φ(a)`, is evaluated in the
//! tail where it does not cancel:
//!
//! ```text
//! a, b standardised;   Φ(z) = ½·erfc(−z/√2)
//!
//! a > 0:   mass = ½·(erfc(a/√2) − erfc(b/√2))     (upper tail)
//! else:    mass = ½·(erfc(−b/√2) − erfc(−a/√2))   (lower tail)
//! ```

use std::f64::consts::{PI, SQRT_2};
use tch::{Kind, Tensor};

/// Floor applied to the interval mass before taking its logarithm.
pub const MIN_INTERVAL_MASS: f64 = 1e-30;

// ---------------------------------------------------------------------------
// Normal
// ---------------------------------------------------------------------------

/// Untruncated Normal distribution with infinite support.
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
}

impl Normal {
    /// Build from batched mean and standard deviation.
    pub fn new(loc: &Tensor, scale: &Tensor) -> Self {
        Normal { loc: loc.shallow_clone(), scale: scale.shallow_clone() }
    }

    /// Mean tensor.
    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    /// Standard-deviation tensor.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    fn standardize(&self, x: &Tensor) -> Tensor {
        (x - &self.loc) / &self.scale
    }

    /// Cumulative distribution function `Φ((x − loc) / scale)`.
    pub fn cdf(&self, x: &Tensor) -> Tensor {
        let z = self.standardize(x);
        ((z / SQRT_2).erf() + 1.0) * 0.5
    }

    /// Log-density `−½z² − log(scale) − ½·log(2π)`.
    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        let z = self.standardize(x);
        z.square() * -0.5 - self.scale.log() - 0.5 * (2.0 * PI).ln()
    }

    /// Mass of `[lower, upper]`, computed without catastrophic cancellation.
    pub fn interval_mass(&self, lower: &Tensor, upper: &Tensor) -> Tensor {
        let a = self.standardize(lower) / SQRT_2;
        let b = self.standardize(upper) / SQRT_2;
        let upper_tail = (a.erfc() - b.erfc()) * 0.5;
        let lower_tail = ((-&b).erfc() - (-&a).erfc()) * 0.5;
        upper_tail.where_self(&a.gt(0.0), &lower_tail)
    }
}

// ---------------------------------------------------------------------------
// TruncatedNormal
// ---------------------------------------------------------------------------

/// Normal distribution restricted to `[lower, upper]` per batch row.
pub struct TruncatedNormal {
    base: Normal,
    lower: Tensor,
    upper: Tensor,
    scale_correction: bool,
}

impl TruncatedNormal {
    /// Truncate `base` to `[lower, upper]`.
    ///
    /// With `scale_correction` set, [`Self::log_prob`] subtracts
    /// `log(scale)` once more on top of the base log-density.
    pub fn new(base: Normal, lower: &Tensor, upper: &Tensor, scale_correction: bool) -> Self {
        TruncatedNormal {
            base,
            lower: lower.shallow_clone(),
            upper: upper.shallow_clone(),
            scale_correction,
        }
    }

    /// The untruncated base distribution.
    pub fn base(&self) -> &Normal {
        &self.base
    }

    /// Base CDF at the lower bound.
    pub fn lower_cdf(&self) -> Tensor {
        self.base.cdf(&self.lower)
    }

    /// Base CDF at the upper bound.
    pub fn upper_cdf(&self) -> Tensor {
        self.base.cdf(&self.upper)
    }

    /// `log(Φ(upper) − Φ(lower))`, floored at [`MIN_INTERVAL_MASS`].
    pub fn log_normalizer(&self) -> Tensor {
        self.base
            .interval_mass(&self.lower, &self.upper)
            .clamp_min(MIN_INTERVAL_MASS)
            .log()
    }

    /// Log-likelihood of `value`:
    ///
    /// ```text
    /// log_prob_untruncated(value) − log(scale) − log(Φ(upper) − Φ(lower))
    /// ```
    ///
    /// The middle term is dropped when scale correction is disabled.
    pub fn log_prob(&self, value: &Tensor) -> Tensor {
        let mut ll = self.base.log_prob(value) - self.log_normalizer();
        if self.scale_correction {
            ll = ll - self.base.scale().log();
        }
        ll
    }

    /// Draw one value per row by inverting the CDF on `[Φ(lower), Φ(upper)]`.
    ///
    /// Rows whose interval lies above the mean are reflected to the lower
    /// tail, where `Φ` keeps full relative precision, and the inversion runs
    /// in `f64`. Results are clamped into `[lower, upper]`.
    pub fn sample(&self) -> Tensor {
        tch::no_grad(|| {
            let kind = self.base.loc.kind();
            let loc = self.base.loc.to_kind(Kind::Double);
            let scale = self.base.scale.to_kind(Kind::Double);
            let alpha = (self.lower.to_kind(Kind::Double) - &loc) / &scale;
            let beta = (self.upper.to_kind(Kind::Double) - &loc) / &scale;

            let reflect = alpha.gt(0.0);
            let a = (-&beta).where_self(&reflect, &alpha);
            let b = (-&alpha).where_self(&reflect, &beta);

            let lo = standard_normal_cdf(&a);
            let hi = standard_normal_cdf(&b);
            let u = Tensor::rand_like(&lo);
            let p = (&lo + (&hi - &lo) * u).clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
            let z = p
                .special_ndtri()
                .clamp_min_tensor(&a)
                .clamp_max_tensor(&b);
            let z = (-&z).where_self(&reflect, &z);

            (loc + scale * z)
                .to_kind(kind)
                .clamp_min_tensor(&self.lower.to_kind(kind))
                .clamp_max_tensor(&self.upper.to_kind(kind))
        })
    }
}

/// `Φ(z)` via `erfc`, accurate in the lower tail.
fn standard_normal_cdf(z: &Tensor) -> Tensor {
    (-z / SQRT_2).erfc() * 0.5
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
