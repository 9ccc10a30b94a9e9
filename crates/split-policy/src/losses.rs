//! Policy-gradient losses for the rule and split heads.
//!
//! Both heads are trained with REINFORCE-style objectives: the per-sample
//! negative log-likelihood of the taken action is weighted by an externally
//! computed return (advantage). The total objective is the plain sum
//!
//! ```text
//! L = Σ_b  w_rule[b] · CE(target_rule[b], p_rule[b])
//!   + Σ_b −w_split[b] · log p_split(sampled_split[b] | lower[b], upper[b])
//! ```
//!
//! with no relative weighting between the two streams.

use tch::{Kind, Tensor};

use crate::distributions::TruncatedNormal;
use crate::error::{PolicyError, PolicyResult};
use crate::rule_head::RuleDistribution;

/// Per-sample rule loss `w · CE(target, p)`. Returns `(loss [B], cross_entropy [B])`.
///
/// # Errors
///
/// Returns [`PolicyError::ShapeMismatch`] if `target` is not `[B, K]` or
/// `return_weight` is not `[B, 1]`.
pub fn rule_policy_loss(
    dist: &RuleDistribution,
    target: &Tensor,
    return_weight: &Tensor,
) -> PolicyResult<(Tensor, Tensor)> {
    let probs_shape = dist.probabilities.size();
    check_shape("target_rule", target, &probs_shape)?;
    check_shape("rule_return_weight", return_weight, &[probs_shape[0], 1])?;

    let cross_entropy = dist.cross_entropy(target);
    let loss = return_weight.squeeze_dim(-1) * &cross_entropy;
    Ok((loss, cross_entropy))
}

/// Per-sample split loss `−w · log p(sample)`. Returns `([B], log_likelihood [B, 1])`.
///
/// # Errors
///
/// Returns [`PolicyError::ShapeMismatch`] if `sampled_split` or
/// `return_weight` is not `[B, 1]`.
pub fn split_policy_loss(
    dist: &TruncatedNormal,
    sampled_split: &Tensor,
    return_weight: &Tensor,
) -> PolicyResult<(Tensor, Tensor)> {
    let expected = dist.base().loc().size();
    check_shape("sampled_split", sampled_split, &expected)?;
    check_shape("split_return_weight", return_weight, &expected)?;

    let log_likelihood = dist.log_prob(&sampled_split.to_kind(Kind::Float));
    let loss = -(&log_likelihood * return_weight).squeeze_dim(-1);
    Ok((loss, log_likelihood))
}

/// Scalar objective: sum over the batch of both per-sample losses.
pub fn total_loss(rule_loss: &Tensor, split_loss: &Tensor) -> Tensor {
    (rule_loss + split_loss).sum(Kind::Float)
}

fn check_shape(input: &'static str, t: &Tensor, expected: &[i64]) -> PolicyResult<()> {
    if t.size() != expected {
        return Err(PolicyError::shape_mismatch(input, expected.to_vec(), t.size()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use approx::assert_abs_diff_eq;

    fn rows(values: &[[f32; 4]]) -> Tensor {
        let flat: Vec<f32> = values.iter().flatten().copied().collect();
        Tensor::from_slice(&flat).view([values.len() as i64, 4])
    }

    fn col(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).view([-1, 1])
    }

    #[test]
    fn rule_loss_is_weighted_per_sample() {
        let p = rows(&[[0.5, 0.5, 0.0, 0.0], [0.25, 0.25, 0.25, 0.25]]);
        let dist = RuleDistribution { premask_probabilities: p.shallow_clone(), probabilities: p };
        let target = rows(&[[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]]);
        let weight = col(&[2.0, -1.0]);

        let (loss, ce) = rule_policy_loss(&dist, &target, &weight).unwrap();
        assert_eq!(loss.size(), vec![2]);
        assert_abs_diff_eq!(ce.double_value(&[0]), 2.0_f64.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(loss.double_value(&[0]), 2.0 * 2.0_f64.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(loss.double_value(&[1]), -(4.0_f64.ln()), epsilon = 1e-5);
    }

    #[test]
    fn rule_loss_rejects_row_weight_shape() {
        let p = rows(&[[0.5, 0.5, 0.0, 0.0]]);
        let dist = RuleDistribution { premask_probabilities: p.shallow_clone(), probabilities: p };
        let target = rows(&[[1.0, 0.0, 0.0, 0.0]]);
        assert!(rule_policy_loss(&dist, &target, &Tensor::from_slice(&[1.0_f32])).is_err());
    }

    #[test]
    fn split_loss_is_negative_weighted_log_likelihood() {
        let base = Normal::new(&col(&[0.5, 0.5]), &col(&[0.2, 0.2]));
        let dist = TruncatedNormal::new(base, &col(&[0.0, 0.0]), &col(&[1.0, 1.0]), true);
        let sample = col(&[0.5, 0.5]);
        let weight = col(&[1.0, 0.0]);

        let (loss, ll) = split_policy_loss(&dist, &sample, &weight).unwrap();
        assert_eq!(loss.size(), vec![2]);
        assert_eq!(ll.size(), vec![2, 1]);
        assert_abs_diff_eq!(loss.double_value(&[0]), -ll.double_value(&[0, 0]), epsilon = 1e-6);
        assert_abs_diff_eq!(loss.double_value(&[1]), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn total_is_plain_sum() {
        let a = Tensor::from_slice(&[1.0_f32, 2.0]);
        let b = Tensor::from_slice(&[0.5_f32, -0.5]);
        assert_abs_diff_eq!(total_loss(&a, &b).double_value(&[]), 3.0, epsilon = 1e-6);
    }
}
