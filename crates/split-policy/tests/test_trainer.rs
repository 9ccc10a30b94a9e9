//! Integration tests for [`split_policy::trainer`].
//!
//! All tests are gated behind `#[cfg(feature = "tch-backend")]`.

#[cfg(feature = "tch-backend")]
mod tch_tests {
    use std::collections::HashMap;

    use approx::assert_abs_diff_eq;
    use split_policy::summary::SUMMARY_FILE;
    use split_policy::{
        OptimizerKind, PolicyConfig, PolicyError, PolicyNetwork, SplitBounds, SummaryWriter,
        Trainer, TrainingBatch,
    };
    use tch::{Device, Kind, Tensor};

    fn cpu() -> Device {
        Device::Cpu
    }

    fn small_config() -> PolicyConfig {
        PolicyConfig {
            image_size: 40,
            rule_hidden_units: 16,
            split_hidden_units: 16,
            ..PolicyConfig::default()
        }
    }

    fn col(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).view([-1, 1])
    }

    /// Batch of 3 with large return weights so that gradients get clipped.
    fn batch(weight: f32) -> TrainingBatch {
        let target: Vec<f32> = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        TrainingBatch {
            images: Tensor::rand([3, 40, 40, 1], (Kind::Float, cpu())),
            rule_mask: Tensor::ones([3, 4], (Kind::Float, cpu())),
            target_rule: Tensor::from_slice(&target).view([3, 4]),
            rule_return_weight: col(&[weight, -weight, weight]),
            bounds: SplitBounds::new(&col(&[0.0, 0.2, 0.4]), &col(&[1.0, 0.6, 0.5])).unwrap(),
            sampled_split: col(&[0.9, 0.3, 0.45]),
            split_return_weight: col(&[weight, weight, -weight]),
        }
    }

    fn snapshot(net: &PolicyNetwork) -> HashMap<String, Tensor> {
        net.var_store()
            .variables()
            .into_iter()
            .map(|(k, v)| (k, v.detach().copy()))
            .collect()
    }

    /// With plain SGD the applied update of every parameter is
    /// `lr · clipped_grad`, so no update can exceed `lr · clip_norm`.
    #[test]
    fn sgd_updates_are_bounded_by_clip_norm() {
        tch::manual_seed(0);
        let cfg = PolicyConfig { optimizer: OptimizerKind::Sgd, learning_rate: 0.01, ..small_config() };
        let mut net = PolicyNetwork::new(&cfg, cpu()).unwrap();
        let mut trainer = Trainer::new(&net).unwrap();

        let before = snapshot(&net);
        let out = trainer.step(&mut net, &batch(1000.0)).unwrap();
        let after = snapshot(&net);

        assert!(out.clip.clipped > 0, "large weights should trigger clipping");
        assert!(out.clip.max_norm > cfg.grad_clip_norm);

        let limit = cfg.learning_rate * cfg.grad_clip_norm;
        let mut largest: f64 = 0.0;
        for (name, old) in &before {
            let delta = (&after[name] - old).norm().double_value(&[]);
            assert!(delta <= limit * (1.0 + 1e-4), "{name}: update norm {delta} > {limit}");
            largest = largest.max(delta);
        }
        // At least one clipped tensor moved by the full clipped step.
        assert_abs_diff_eq!(largest, limit, epsilon = limit * 1e-3);
    }

    /// Adam steps run, count up, and report finite losses.
    #[test]
    fn adam_step_reports_losses() {
        tch::manual_seed(1);
        let mut net = PolicyNetwork::new(&small_config(), cpu()).unwrap();
        let mut trainer = Trainer::new(&net).unwrap();

        for expected in 1..=3 {
            let out = trainer.step(&mut net, &batch(1.0)).unwrap();
            assert_eq!(out.step, expected);
            assert!(out.total_loss.is_finite());
            assert_abs_diff_eq!(out.total_loss, out.rule_loss + out.split_loss, epsilon = 1e-3);
        }
        assert_eq!(trainer.steps(), 3);
    }

    /// Zero return weights produce zero loss and leave SGD parameters unchanged.
    #[test]
    fn zero_returns_do_not_move_parameters() {
        tch::manual_seed(2);
        let cfg = PolicyConfig { optimizer: OptimizerKind::Sgd, ..small_config() };
        let mut net = PolicyNetwork::new(&cfg, cpu()).unwrap();
        let mut trainer = Trainer::new(&net).unwrap();

        let before = snapshot(&net);
        let out = trainer.step(&mut net, &batch(0.0)).unwrap();
        assert_abs_diff_eq!(out.total_loss, 0.0, epsilon = 1e-9);
        assert_eq!(out.clip.clipped, 0);

        for (name, t) in snapshot(&net) {
            assert_eq!((&t - &before[&name]).abs().max().double_value(&[]), 0.0, "{name}");
        }
    }

    /// Summaries are appended once per step with the monitored scalars.
    #[test]
    fn summaries_are_written_per_step() {
        tch::manual_seed(3);
        let tmp = tempfile::tempdir().unwrap();
        let mut net = PolicyNetwork::new(&small_config(), cpu()).unwrap();
        let mut trainer = Trainer::new(&net)
            .unwrap()
            .with_summary_writer(SummaryWriter::create(tmp.path()).unwrap());

        let out = trainer.step(&mut net, &batch(2.0)).unwrap();
        trainer.step(&mut net, &batch(2.0)).unwrap();

        // Mean of [2, -2, 2].
        assert_abs_diff_eq!(out.summaries.reward_weight, 2.0 / 3.0, epsilon = 1e-6);
        assert!(out.summaries.split_mean > 0.0 && out.summaries.split_mean < 1.0);
        assert!(out.summaries.split_variance > 0.0);

        let text = std::fs::read_to_string(tmp.path().join(SUMMARY_FILE)).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 2);
        for key in ["split_log_likelihood", "rule_cross_entropy", "reward_weight", "split_mean", "split_variance"] {
            assert!(lines[0][key].is_number(), "missing {key}");
        }
    }

    /// A NaN return weight is refused before the optimiser moves anything.
    #[test]
    fn non_finite_batch_leaves_parameters_untouched() {
        tch::manual_seed(5);
        let mut net = PolicyNetwork::new(&small_config(), cpu()).unwrap();
        let mut trainer = Trainer::new(&net).unwrap();

        let before = snapshot(&net);
        let mut b = batch(1.0);
        b.rule_return_weight = col(&[1.0, f32::NAN, 1.0]);
        assert!(matches!(
            trainer.step(&mut net, &b),
            Err(PolicyError::NonFiniteStep { step: 1, .. })
        ));
        assert_eq!(trainer.steps(), 0);
        for (name, t) in snapshot(&net) {
            assert_eq!((&t - &before[&name]).abs().max().double_value(&[]), 0.0, "{name}");
        }

        // The next clean batch trains normally.
        let out = trainer.step(&mut net, &batch(1.0)).unwrap();
        assert_eq!(out.step, 1);
        assert!(out.total_loss.is_finite());
        for (name, t) in snapshot(&net) {
            assert_eq!(t.isfinite().logical_not().sum(Kind::Int64).int64_value(&[]), 0, "{name} is not finite");
        }
    }

    /// A trainer only steps the network it was built for.
    #[test]
    fn trainer_rejects_a_different_network() {
        tch::manual_seed(6);
        let net_a = PolicyNetwork::new(&small_config(), cpu()).unwrap();
        let mut net_b = PolicyNetwork::new(&small_config(), cpu()).unwrap();
        let mut trainer = Trainer::new(&net_a).unwrap();

        let before = snapshot(&net_b);
        assert!(matches!(
            trainer.step(&mut net_b, &batch(1.0)),
            Err(PolicyError::TrainerMismatch { .. })
        ));
        assert_eq!(trainer.steps(), 0);
        for (name, t) in snapshot(&net_b) {
            assert_eq!((&t - &before[&name]).abs().max().double_value(&[]), 0.0, "{name}");
        }
    }

    /// Return weights must be `[B, 1]`.
    #[test]
    fn malformed_return_weight_is_rejected() {
        let mut net = PolicyNetwork::new(&small_config(), cpu()).unwrap();
        let mut trainer = Trainer::new(&net).unwrap();
        let mut b = batch(1.0);
        b.rule_return_weight = Tensor::ones([3], (Kind::Float, cpu()));
        assert!(matches!(
            trainer.step(&mut net, &b),
            Err(PolicyError::ShapeMismatch { input: "rule_return_weight", .. })
        ));
        assert_eq!(trainer.steps(), 0);
    }
}

// When tch-backend is disabled, ensure the file still compiles cleanly.
#[cfg(not(feature = "tch-backend"))]
#[test]
fn tch_backend_not_enabled() {
    // This test passes trivially when the tch-backend feature is absent.
}
