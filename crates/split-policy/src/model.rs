//! The full rule/split policy network.
//!
//! # Architecture
//!
//! ```text
//! images [B, H, W, 1]
//!       │
//!       ▼
//! ┌───────────────────┐
//! │   FeatureTrunk    │  7 × conv3x3 (strides 1,1,1,2,2,2,2) → flatten
//! └───────────────────┘
//!       │ features [B, F]
//!   ┌───┴────────┐
//!   ▼            ▼
//! ┌──────────┐ ┌───────────┐
//! │ RuleHead │ │ SplitHead │
//! └──────────┘ └───────────┘
//! masked        truncated
//! categorical   Normal(mean, scale) on [lower, upper]
//! ```
//!
//! All parameters live in a single [`nn::VarStore`] under the prefixes
//! `trunk.`, `rule.` and `split.`, which is also the naming used in
//! checkpoints.
//!
//! The device is passed in explicitly; the network never consults global
//! runtime state.

use std::path::Path;

use ndarray::Array2;
use tch::{nn, nn::Module, Device, Kind, Tensor};
use tracing::info;

use crate::checkpoint::{CheckpointManager, RestoreReport};
use crate::config::PolicyConfig;
use crate::distributions::TruncatedNormal;
use crate::error::{PolicyError, PolicyResult};
use crate::rule_head::{RuleDistribution, RuleHead};
use crate::split_head::{SplitBounds, SplitHead, SplitParams};
use crate::trunk::FeatureTrunk;

// ---------------------------------------------------------------------------
// Public output types
// ---------------------------------------------------------------------------

/// Outputs of a single forward pass of [`PolicyNetwork`].
pub struct PolicyOutput {
    /// Flattened trunk features: `[B, F]`.
    pub features: Tensor,
    /// Masked rule distribution.
    pub rule: RuleDistribution,
    /// Split mean / scale.
    pub split_params: SplitParams,
    /// Split distribution truncated to the supplied bounds.
    pub split: TruncatedNormal,
}

impl PolicyOutput {
    /// Masked rule probabilities copied to the host: `[B, K]`.
    pub fn rule_probabilities(&self) -> PolicyResult<Array2<f32>> {
        tensor_to_array2(&self.rule.probabilities)
    }
}

/// Actions drawn from the policy for one batch.
pub struct PolicyAction {
    /// Sampled rule index per row: `[B]` of `Int64`.
    pub rules: Tensor,
    /// Sampled split coordinate per row: `[B, 1]`.
    pub splits: Tensor,
}

// ---------------------------------------------------------------------------
// PolicyNetwork
// ---------------------------------------------------------------------------

/// Convolutional policy with a masked rule head and a truncated split head.
pub struct PolicyNetwork {
    vs: nn::VarStore,
    trunk: FeatureTrunk,
    rule_head: RuleHead,
    split_head: SplitHead,
    config: PolicyConfig,
}

impl PolicyNetwork {
    /// Build a freshly initialised network on `device`.
    ///
    /// Every layer is registered in the internal `VarStore` here, so the
    /// network is runnable (and trainable) immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Config`] if `config` does not validate.
    pub fn new(config: &PolicyConfig, device: Device) -> PolicyResult<Self> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let trunk = FeatureTrunk::new(&(&root / "trunk"), config);
        let feature_len = trunk.feature_len();
        let rule_head = RuleHead::new(&(&root / "rule"), feature_len, config);
        let split_head = SplitHead::new(&(&root / "split"), feature_len, config);

        let network = PolicyNetwork { vs, trunk, rule_head, split_head, config: config.clone() };
        info!(
            device = ?device,
            feature_len,
            parameters = network.num_parameters(),
            "policy network initialised"
        );
        Ok(network)
    }

    /// Build the network and, if `pretrained` is given, warm-start it from
    /// that checkpoint with a shape-matched restore.
    pub fn create(
        config: &PolicyConfig,
        device: Device,
        pretrained: Option<&Path>,
    ) -> PolicyResult<(Self, Option<RestoreReport>)> {
        let mut network = Self::new(config, device)?;
        let report = match pretrained {
            Some(path) => Some(CheckpointManager::restore(&mut network.vs, path)?),
            None => None,
        };
        Ok((network, report))
    }

    /// Forward pass with gradient tracking.
    ///
    /// # Arguments
    ///
    /// - `images`:    `[B, image_size, image_size, num_channels]`
    /// - `rule_mask`: `[B, num_rules]`, values in {0, 1}
    /// - `bounds`:    per-row split interval
    pub fn forward(
        &self,
        images: &Tensor,
        rule_mask: &Tensor,
        bounds: &SplitBounds,
    ) -> PolicyResult<PolicyOutput> {
        let images = self.prepare_images(images)?;
        let device = self.vs.device();

        let features = self.trunk.forward(&images);
        let rule = self.rule_head.distribution(&features, &rule_mask.to_device(device))?;
        let split_params = self.split_head.params(&features);
        let split = self
            .split_head
            .distribution(&split_params, &bounds.to_device(device))?;

        Ok(PolicyOutput { features, rule, split_params, split })
    }

    /// Forward pass without gradient tracking.
    pub fn forward_inference(
        &self,
        images: &Tensor,
        rule_mask: &Tensor,
        bounds: &SplitBounds,
    ) -> PolicyResult<PolicyOutput> {
        tch::no_grad(|| self.forward(images, rule_mask, bounds))
    }

    /// Sample one rule and one split per row.
    pub fn act(
        &self,
        images: &Tensor,
        rule_mask: &Tensor,
        bounds: &SplitBounds,
    ) -> PolicyResult<PolicyAction> {
        let out = self.forward_inference(images, rule_mask, bounds)?;
        Ok(PolicyAction { rules: out.rule.sample()?, splits: out.split.sample() })
    }

    /// The configuration the network was built from.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Device holding the parameters.
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Count total trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel())
            .sum()
    }

    /// Access the internal `VarStore` (e.g. to create an optimiser).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore`.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn prepare_images(&self, images: &Tensor) -> PolicyResult<Tensor> {
        let size = self.config.image_size as i64;
        let channels = self.config.num_channels as i64;
        let shape = images.size();
        if shape.len() != 4 || shape[1..] != [size, size, channels] {
            return Err(PolicyError::shape_mismatch(
                "images",
                vec![-1, size, size, channels],
                shape,
            ));
        }
        Ok(images.to_device(self.vs.device()).to_kind(Kind::Float))
    }
}

/// Copy a 2-D tensor to a host-side `ndarray`.
pub fn tensor_to_array2(t: &Tensor) -> PolicyResult<Array2<f32>> {
    let shape = t.size();
    if shape.len() != 2 {
        return Err(PolicyError::shape_mismatch("tensor", vec![-1, -1], shape));
    }
    let flat = t
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view([-1]);
    let values = Vec::<f32>::try_from(&flat)?;
    let len = values.len() as i64;
    Array2::from_shape_vec((shape[0] as usize, shape[1] as usize), values)
        .map_err(|_| PolicyError::shape_mismatch("tensor", shape.clone(), vec![len]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
