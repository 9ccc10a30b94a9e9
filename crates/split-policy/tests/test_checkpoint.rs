//! Integration tests for [`split_policy::checkpoint`].
//!
//! Save / restore tests are gated behind `#[cfg(feature = "tch-backend")]`
//! because they need the tensor runtime.

#[cfg(feature = "tch-backend")]
mod tch_tests {
    use split_policy::checkpoint::{CheckpointId, CheckpointManager};
    use split_policy::error::CheckpointError;
    use split_policy::{PolicyConfig, PolicyNetwork};
    use tch::{nn, Device, Kind, Tensor};

    fn small_config() -> PolicyConfig {
        PolicyConfig {
            image_size: 40,
            rule_hidden_units: 16,
            split_hidden_units: 16,
            ..PolicyConfig::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    /// Save writes the versioned file name and a fresh network restores every
    /// variable from it.
    #[test]
    fn save_then_restore_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(tmp.path().join("saved_models"));

        tch::manual_seed(1);
        let original = PolicyNetwork::new(&small_config(), Device::Cpu).unwrap();
        let path = mgr.save(original.var_store(), 2, Some(40)).unwrap();
        assert_eq!(path.file_name().unwrap(), "model_epoch2_iter40.ot");

        tch::manual_seed(2);
        let (restored, report) =
            PolicyNetwork::create(&small_config(), Device::Cpu, Some(&path)).unwrap();
        let report = report.unwrap();
        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.restored.len(), original.var_store().variables().len());

        let before = original.var_store().variables();
        let after = restored.var_store().variables();
        for (name, t) in &before {
            assert_eq!(max_abs_diff(t, &after[name]), 0.0, "{name} differs");
        }
    }

    /// Changing a layer's width skips exactly that layer's tensors and still
    /// restores the rest.
    #[test]
    fn reshaped_layers_keep_their_initial_values() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(tmp.path());

        tch::manual_seed(3);
        let old = PolicyNetwork::new(&small_config(), Device::Cpu).unwrap();
        let path = mgr.save(old.var_store(), 0, None).unwrap();

        let wider = PolicyConfig { rule_hidden_units: 32, ..small_config() };
        tch::manual_seed(4);
        let fresh = PolicyNetwork::new(&wider, Device::Cpu).unwrap();
        let fresh_logits = fresh.var_store().variables()["rule.logits.weight"].copy();

        tch::manual_seed(4);
        let (net, report) = PolicyNetwork::create(&wider, Device::Cpu, Some(&path)).unwrap();
        let report = report.unwrap();

        let mismatched: Vec<&str> = report.shape_mismatched.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(mismatched, vec!["rule.fc6.bias", "rule.fc6.weight", "rule.logits.weight"]);
        let fc6 = &report.shape_mismatched[1];
        assert_eq!(fc6.saved_shape, vec![16, 20]);
        assert_eq!(fc6.current_shape, vec![32, 20]);
        assert!(report.missing.is_empty());
        assert!(report.unused.is_empty());

        let vars = net.var_store().variables();
        let old_vars = old.var_store().variables();
        // Same-shaped variables come from the checkpoint.
        assert_eq!(max_abs_diff(&vars["trunk.conv0.weight"], &old_vars["trunk.conv0.weight"]), 0.0);
        assert_eq!(max_abs_diff(&vars["rule.logits.bias"], &old_vars["rule.logits.bias"]), 0.0);
        // Reshaped ones keep the seeded initial value.
        assert_eq!(max_abs_diff(&vars["rule.logits.weight"], &fresh_logits), 0.0);
    }

    /// Names present on only one side are reported, not fatal.
    #[test]
    fn missing_and_unused_names_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("foreign.ot");

        let conv0 = Tensor::ones([20, 1, 3, 3], (Kind::Float, Device::Cpu));
        let extra = Tensor::zeros([5], (Kind::Float, Device::Cpu));
        Tensor::save_multi(&[("trunk.conv0.weight", &conv0), ("value.head.weight", &extra)], &path)
            .unwrap();

        let mut net = PolicyNetwork::new(&small_config(), Device::Cpu).unwrap();
        let report = CheckpointManager::restore(net.var_store_mut(), &path).unwrap();

        assert_eq!(report.restored, vec!["trunk.conv0.weight".to_string()]);
        assert_eq!(report.unused, vec!["value.head.weight".to_string()]);
        assert_eq!(report.missing.len(), net.var_store().variables().len() - 1);
        assert!(report.missing.contains(&"split.scale.bias".to_string()));

        let restored = &net.var_store().variables()["trunk.conv0.weight"];
        assert_eq!(restored.sum(Kind::Float).double_value(&[]), 180.0);
    }

    /// Restored variables remain trainable leaves.
    #[test]
    fn restore_keeps_variables_trainable() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(tmp.path());
        let net = PolicyNetwork::new(&small_config(), Device::Cpu).unwrap();
        let path = mgr.save(net.var_store(), 0, None).unwrap();

        let mut vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().sub("trunk").sub("conv0").zeros("bias", &[20]);
        let report = CheckpointManager::restore(&mut vs, &path).unwrap();
        assert_eq!(report.restored, vec!["trunk.conv0.bias".to_string()]);
        assert!(vs.trainable_variables()[0].requires_grad());
    }

    /// A non-existent path is `NotFound`.
    #[test]
    fn restoring_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut net = PolicyNetwork::new(&small_config(), Device::Cpu).unwrap();
        let err = CheckpointManager::restore(net.var_store_mut(), &tmp.path().join("nope.ot"));
        assert!(matches!(err, Err(CheckpointError::NotFound { .. })));
    }

    /// `latest` sees files written by `save`.
    #[test]
    fn latest_follows_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(tmp.path());
        let net = PolicyNetwork::new(&small_config(), Device::Cpu).unwrap();

        mgr.save(net.var_store(), 0, Some(10)).unwrap();
        mgr.save(net.var_store(), 0, None).unwrap();
        mgr.save(net.var_store(), 1, Some(5)).unwrap();

        let (id, path) = mgr.latest().unwrap().unwrap();
        assert_eq!(id, CheckpointId { epoch: 1, iteration: Some(5) });
        assert_eq!(path, mgr.path_for(1, Some(5)));
    }
}

// When tch-backend is disabled, ensure the file still compiles cleanly.
#[cfg(not(feature = "tch-backend"))]
#[test]
fn tch_backend_not_enabled() {
    // This test passes trivially when the tch-backend feature is absent.
}
