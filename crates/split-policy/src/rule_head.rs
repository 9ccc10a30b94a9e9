//! Masked categorical policy over the discrete rule set.
//!
//! ```text
//! features ─► Linear(F, 200) ─► ReLU ─► Linear(200, K) ─► logits
//!                                                            │
//!                              invalid rules ─► −∞ ─► softmax ─► rule probabilities
//! ```
//!
//! The mask zeroes rules that are invalid for the current state and the
//! remaining mass is renormalised so every row sums to one. Masking is applied
//! to the logits, so a row keeps a proper distribution over its valid rules
//! even when a masked rule dominates the unmasked softmax. Rows whose mask
//! allows no rule are handled according to [`EmptyMaskPolicy`].

use tch::{nn, nn::Module, Kind, Tensor};
use tracing::warn;

use crate::config::{EmptyMaskPolicy, PolicyConfig};
use crate::error::{PolicyError, PolicyResult};

/// Probability floor used by the cross-entropy, matching the usual
/// `clip(p, ε, 1 − ε)` convention.
pub const CROSS_ENTROPY_EPS: f64 = 1e-7;

/// Rule probabilities before and after masking.
pub struct RuleDistribution {
    /// Softmax output ignoring the mask: `[B, K]`.
    pub premask_probabilities: Tensor,
    /// Masked and renormalised probabilities: `[B, K]`.
    pub probabilities: Tensor,
}

impl RuleDistribution {
    /// Draw one rule index per row. Returns `[B]` of `Int64`.
    pub fn sample(&self) -> PolicyResult<Tensor> {
        let drawn = tch::no_grad(|| self.probabilities.f_multinomial(1, true))?;
        Ok(drawn.squeeze_dim(1))
    }

    /// Most probable rule per row. Returns `[B]` of `Int64`.
    pub fn argmax(&self) -> Tensor {
        self.probabilities.argmax(-1, false)
    }

    /// Categorical cross-entropy against `target` (`[B, K]`, one-hot or soft).
    /// Returns `[B]`.
    pub fn cross_entropy(&self, target: &Tensor) -> Tensor {
        let clipped = self
            .probabilities
            .clamp(CROSS_ENTROPY_EPS, 1.0 - CROSS_ENTROPY_EPS);
        -(target * clipped.log()).sum_dim_intlist(&[-1_i64][..], false, Kind::Float)
    }
}

/// Two-layer dense head producing a masked categorical distribution.
#[derive(Debug)]
pub struct RuleHead {
    hidden: nn::Linear,
    logits: nn::Linear,
    num_rules: i64,
    empty_mask_policy: EmptyMaskPolicy,
}

impl RuleHead {
    /// Register `fc6` and `logits` under `path`.
    pub fn new(path: &nn::Path, feature_len: i64, config: &PolicyConfig) -> Self {
        let hidden_units = config.rule_hidden_units as i64;
        let num_rules = config.num_rules as i64;
        RuleHead {
            hidden: nn::linear(path / "fc6", feature_len, hidden_units, Default::default()),
            logits: nn::linear(path / "logits", hidden_units, num_rules, Default::default()),
            num_rules,
            empty_mask_policy: config.empty_mask_policy,
        }
    }

    /// Number of discrete rules `K`.
    pub fn num_rules(&self) -> i64 {
        self.num_rules
    }

    /// Unnormalised rule scores: `[B, K]`.
    pub fn logits(&self, features: &Tensor) -> Tensor {
        let h = self.hidden.forward(features).relu();
        self.logits.forward(&h)
    }

    /// Build the masked distribution for `features` (`[B, F]`) under
    /// `mask` (`[B, K]`, values in {0, 1}).
    ///
    /// # Errors
    ///
    /// - [`PolicyError::ShapeMismatch`] if `mask` is not `[B, K]`.
    /// - [`PolicyError::EmptyRuleMask`] if a row allows no rule and the
    ///   policy is [`EmptyMaskPolicy::Reject`].
    pub fn distribution(&self, features: &Tensor, mask: &Tensor) -> PolicyResult<RuleDistribution> {
        let batch = features.size()[0];
        let expected = vec![batch, self.num_rules];
        if mask.size() != expected {
            return Err(PolicyError::shape_mismatch("rule_mask", expected, mask.size()));
        }

        let logits = self.logits(features);
        let premask_probabilities = logits.softmax(-1, Kind::Float);
        let probabilities = masked_softmax(&logits, mask, self.empty_mask_policy)?;
        Ok(RuleDistribution { premask_probabilities, probabilities })
    }
}

/// Softmax over the rules `mask` allows, i.e. `softmax(logits) × mask`
/// renormalised per row.
///
/// Invalid rules get a logit of `−∞` before the softmax, so the result never
/// underflows to an all-zero row while some rule is still allowed. Rows with
/// no valid rule are rejected or set to `1 / K`, depending on `policy`; their
/// logits are left unmasked so the unselected branch stays finite.
pub fn masked_softmax(
    logits: &Tensor,
    mask: &Tensor,
    policy: EmptyMaskPolicy,
) -> PolicyResult<Tensor> {
    let allowed = mask.gt(0.0);
    let row_valid = allowed.sum_dim_intlist(&[-1_i64][..], true, Kind::Int64).gt(0);
    let empty_rows = empty_rows(&row_valid);

    if !empty_rows.is_empty() && policy == EmptyMaskPolicy::Reject {
        return Err(PolicyError::EmptyRuleMask { rows: empty_rows });
    }

    let blocked = allowed.logical_not().logical_and(&row_valid);
    let probabilities = logits
        .masked_fill(&blocked, f64::NEG_INFINITY)
        .softmax(-1, Kind::Float);

    if empty_rows.is_empty() {
        return Ok(probabilities);
    }
    warn!(rows = ?empty_rows, "rule mask allows no rule; using uniform distribution");
    let uniform = probabilities.ones_like() / logits.size()[1] as f64;
    Ok(probabilities.where_self(&row_valid, &uniform))
}

fn empty_rows(row_valid: &Tensor) -> Vec<i64> {
    let invalid = row_valid.logical_not().squeeze_dim(-1).nonzero().view([-1]);
    (0..invalid.size()[0]).map(|i| invalid.int64_value(&[i])).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
