//! REINFORCE training step for [`PolicyNetwork`].
//!
//! One call to [`Trainer::step`]:
//!
//! 1. Runs the network forward on a [`TrainingBatch`].
//! 2. Evaluates the combined rule + split loss (see [`crate::losses`]).
//! 3. Back-propagates, clips every parameter's gradient to its own L2-norm
//!    ceiling and applies one optimiser update.
//!
//! A batch whose loss or gradients are not finite is refused before the
//! update: the gradients are zeroed, the step counter is left alone and
//! [`PolicyError::NonFiniteStep`] is returned.
//!
//! The step borrows the network mutably, so inference on the same network
//! cannot interleave with an update.

use tch::{nn, nn::OptimizerConfig, Kind, Tensor};
use tracing::{debug, warn};

use crate::config::OptimizerKind;
use crate::error::{PolicyError, PolicyResult};
use crate::losses::{rule_policy_loss, split_policy_loss, total_loss};
use crate::model::PolicyNetwork;
use crate::split_head::SplitBounds;
use crate::summary::{ScalarSummaries, SummaryWriter};

/// One batch of recorded decisions and their returns.
pub struct TrainingBatch {
    /// `[B, H, W, C]` input images.
    pub images: Tensor,
    /// `[B, K]` valid-rule mask.
    pub rule_mask: Tensor,
    /// `[B, K]` one-hot (or soft) target rule.
    pub target_rule: Tensor,
    /// `[B, 1]` return weight for the rule loss.
    pub rule_return_weight: Tensor,
    /// Split interval per row.
    pub bounds: SplitBounds,
    /// `[B, 1]` split that was taken.
    pub sampled_split: Tensor,
    /// `[B, 1]` return weight for the split loss.
    pub split_return_weight: Tensor,
}

/// Result of gradient clipping.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClipStats {
    /// Number of gradient tensors that were rescaled.
    pub clipped: usize,
    /// Largest finite gradient norm seen before clipping.
    pub max_norm: f64,
    /// Number of gradient tensors whose norm was NaN or infinite.
    /// These are left untouched.
    pub non_finite: usize,
}

/// Scalars produced by one training step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    /// Step index (1-based).
    pub step: u64,
    /// Summed objective that was back-propagated.
    pub total_loss: f64,
    /// Batch sum of the rule loss.
    pub rule_loss: f64,
    /// Batch sum of the split loss.
    pub split_loss: f64,
    /// Gradient clipping outcome.
    pub clip: ClipStats,
    /// Monitoring scalars.
    pub summaries: ScalarSummaries,
}

/// Optimiser plus gradient-clipping state for one network.
pub struct Trainer {
    opt: nn::Optimizer,
    vars: Vec<Tensor>,
    var_ptrs: Vec<usize>,
    grad_clip_norm: f64,
    steps: u64,
    summary_writer: Option<SummaryWriter>,
}

impl Trainer {
    /// Build the optimiser configured in `network.config()` over all of the
    /// network's trainable variables.
    ///
    /// The trainer is bound to those variables: [`Trainer::step`] rejects any
    /// other network.
    pub fn new(network: &PolicyNetwork) -> PolicyResult<Self> {
        let config = network.config();
        let vs = network.var_store();
        let opt = match config.optimizer {
            OptimizerKind::Adam => nn::Adam::default().build(vs, config.learning_rate)?,
            OptimizerKind::Sgd => nn::Sgd::default().build(vs, config.learning_rate)?,
        };
        let vars = vs.trainable_variables();
        let var_ptrs = storage_ptrs(&vars);
        Ok(Trainer {
            opt,
            vars,
            var_ptrs,
            grad_clip_norm: config.grad_clip_norm,
            steps: 0,
            summary_writer: None,
        })
    }

    /// Record a summary line for every step.
    pub fn with_summary_writer(mut self, writer: SummaryWriter) -> Self {
        self.summary_writer = Some(writer);
        self
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Run one forward / backward / clip / update cycle.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::TrainerMismatch`] if `network` is not the network the
    ///   trainer was built for.
    /// - [`PolicyError::NonFiniteStep`] if the loss or any gradient is NaN or
    ///   infinite; parameters and the step count are unchanged.
    /// - Shape and mask errors from the forward pass and the loss, and I/O
    ///   errors from the summary writer.
    pub fn step(&mut self, network: &mut PolicyNetwork, batch: &TrainingBatch) -> PolicyResult<StepOutput> {
        let network_vars = network.var_store().trainable_variables();
        if storage_ptrs(&network_vars) != self.var_ptrs {
            return Err(PolicyError::TrainerMismatch {
                expected: self.var_ptrs.len(),
                actual: network_vars.len(),
            });
        }

        let out = network.forward(&batch.images, &batch.rule_mask, &batch.bounds)?;
        let device = network.device();

        let target_rule = batch.target_rule.to_device(device).to_kind(Kind::Float);
        let rule_weight = batch.rule_return_weight.to_device(device).to_kind(Kind::Float);
        let split_weight = batch.split_return_weight.to_device(device).to_kind(Kind::Float);
        let sampled_split = batch.sampled_split.to_device(device);

        let (rule_loss, cross_entropy) = rule_policy_loss(&out.rule, &target_rule, &rule_weight)?;
        let (split_loss, log_likelihood) = split_policy_loss(&out.split, &sampled_split, &split_weight)?;
        let loss = total_loss(&rule_loss, &split_loss);

        self.opt.zero_grad();
        loss.backward();
        let clip = clip_gradients_by_norm(&self.vars, self.grad_clip_norm);

        let total = loss.double_value(&[]);
        if !total.is_finite() || clip.non_finite > 0 {
            self.opt.zero_grad();
            warn!(
                step = self.steps + 1,
                loss = total,
                non_finite_grads = clip.non_finite,
                "skipping update for non-finite batch"
            );
            return Err(PolicyError::NonFiniteStep {
                step: self.steps + 1,
                loss: total,
                non_finite_grads: clip.non_finite,
            });
        }
        self.opt.step();
        self.steps += 1;

        let summaries = ScalarSummaries {
            split_log_likelihood: batch_mean(&log_likelihood),
            rule_cross_entropy: batch_mean(&cross_entropy),
            reward_weight: batch_mean(&rule_weight),
            split_mean: batch_mean(&out.split_params.mean),
            split_variance: batch_mean(&out.split_params.scale),
        };
        if let Some(writer) = self.summary_writer.as_mut() {
            writer.write(self.steps, &summaries)?;
        }

        let output = StepOutput {
            step: self.steps,
            total_loss: total,
            rule_loss: rule_loss.sum(Kind::Float).double_value(&[]),
            split_loss: split_loss.sum(Kind::Float).double_value(&[]),
            clip,
            summaries,
        };
        debug!(
            step = output.step,
            loss = output.total_loss,
            rule_loss = output.rule_loss,
            split_loss = output.split_loss,
            clipped = clip.clipped,
            max_grad_norm = clip.max_norm,
            "training step"
        );
        Ok(output)
    }
}

/// Rescale each gradient in place so its L2 norm is at most `max_norm`:
/// `g ← g · max_norm / max(‖g‖, max_norm)`.
///
/// Every tensor is clipped independently; there is no global norm.
/// Variables without a gradient are skipped, and gradients with a non-finite
/// norm are only counted.
pub fn clip_gradients_by_norm(vars: &[Tensor], max_norm: f64) -> ClipStats {
    tch::no_grad(|| {
        let mut stats = ClipStats::default();
        for var in vars {
            let mut grad = var.grad();
            if !grad.defined() {
                continue;
            }
            let norm = grad.norm().double_value(&[]);
            if !norm.is_finite() {
                stats.non_finite += 1;
                continue;
            }
            stats.max_norm = stats.max_norm.max(norm);
            if norm > max_norm {
                let scaled = &grad * (max_norm / norm);
                grad.copy_(&scaled);
                stats.clipped += 1;
            }
        }
        stats
    })
}

/// Sorted storage addresses of `vars`; identifies a set of parameters.
fn storage_ptrs(vars: &[Tensor]) -> Vec<usize> {
    let mut ptrs: Vec<usize> = vars.iter().map(|v| v.data_ptr() as usize).collect();
    ptrs.sort_unstable();
    ptrs
}

fn batch_mean(t: &Tensor) -> f64 {
    t.detach().mean(Kind::Float).double_value(&[])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tch::Device;

    #[test]
    fn large_gradient_is_clipped_to_exact_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[4]);
        let loss = (&w * 100.0).sum(Kind::Float);
        loss.backward();

        let stats = clip_gradients_by_norm(&vs.trainable_variables(), 10.0);
        assert_eq!(stats.clipped, 1);
        assert_abs_diff_eq!(stats.max_norm, 200.0, epsilon = 1e-3);
        assert_abs_diff_eq!(w.grad().norm().double_value(&[]), 10.0, epsilon = 1e-4);
    }

    #[test]
    fn small_gradient_is_untouched() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[4]);
        let loss = (&w * 0.5).sum(Kind::Float);
        loss.backward();

        let stats = clip_gradients_by_norm(&vs.trainable_variables(), 10.0);
        assert_eq!(stats.clipped, 0);
        assert_abs_diff_eq!(w.grad().double_value(&[2]), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn each_tensor_is_clipped_independently() {
        let vs = nn::VarStore::new(Device::Cpu);
        let big = vs.root().zeros("big", &[1]);
        let small = vs.root().zeros("small", &[1]);
        let loss = (&big * 50.0 + &small * 3.0).sum(Kind::Float);
        loss.backward();

        let stats = clip_gradients_by_norm(&vs.trainable_variables(), 10.0);
        assert_eq!(stats.clipped, 1);
        assert_abs_diff_eq!(big.grad().double_value(&[0]), 10.0, epsilon = 1e-5);
        // A global-norm clip would have shrunk this one too.
        assert_abs_diff_eq!(small.grad().double_value(&[0]), 3.0, epsilon = 1e-6);
    }

    #[test]
    fn infinite_gradient_is_counted_not_clipped() {
        let vs = nn::VarStore::new(Device::Cpu);
        let bad = vs.root().zeros("bad", &[2]);
        let good = vs.root().zeros("good", &[2]);
        let loss = (&bad * f64::INFINITY + &good * 100.0).sum(Kind::Float);
        loss.backward();

        let stats = clip_gradients_by_norm(&vs.trainable_variables(), 10.0);
        assert_eq!(stats.non_finite, 1);
        assert_eq!(stats.clipped, 1);
        assert!(stats.max_norm.is_finite());
        assert_abs_diff_eq!(good.grad().norm().double_value(&[]), 10.0, epsilon = 1e-4);
    }

    #[test]
    fn storage_ptrs_identify_a_var_store() {
        let a = nn::VarStore::new(Device::Cpu);
        a.root().zeros("w", &[3]);
        a.root().zeros("b", &[1]);
        let b = nn::VarStore::new(Device::Cpu);
        b.root().zeros("w", &[3]);
        b.root().zeros("b", &[1]);

        let ptrs = storage_ptrs(&a.trainable_variables());
        assert_eq!(ptrs, storage_ptrs(&a.trainable_variables()));
        assert_ne!(ptrs, storage_ptrs(&b.trainable_variables()));
    }

    #[test]
    fn sgd_update_equals_learning_rate_times_clipped_gradient() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[4]);
        let mut opt = nn::Sgd::default().build(&vs, 0.1).unwrap();

        opt.zero_grad();
        (&w * 100.0).sum(Kind::Float).backward();
        clip_gradients_by_norm(&vs.trainable_variables(), 10.0);
        opt.step();

        // Clipped gradient is 5 per element (norm 10), so w = -0.1 * 5.
        for i in 0..4 {
            assert_abs_diff_eq!(w.double_value(&[i]), -0.5, epsilon = 1e-6);
        }
    }
}
