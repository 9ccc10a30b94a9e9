//! # Split Policy Network
//!
//! A convolutional policy that, given an image of the current state, chooses
//! two coupled actions at once:
//!
//! - a **rule**: one of `K` discrete options, drawn from a categorical
//!   distribution that is masked by the currently valid rules;
//! - a **split**: a continuous coordinate drawn from a Normal distribution
//!   truncated to a per-sample interval.
//!
//! Both heads are trained with REINFORCE-style losses weighted by externally
//! computed returns, clipped per parameter, and optimised with Adam.
//!
//! ## Architecture
//!
//! ```text
//! PolicyConfig ──► PolicyNetwork ──► Trainer
//!                    │                  │
//!              FeatureTrunk        losses / clip_gradients_by_norm
//!               ┌────┴────┐             │
//!           RuleHead   SplitHead   SummaryWriter
//!               │          │
//!      masked_softmax  TruncatedNormal
//!
//! CheckpointManager  ◄──►  nn::VarStore (save / shape-matched restore)
//! ```
//!
//! Everything that touches tensors requires the `tch-backend` feature.
//! Configuration, errors, checkpoint naming and summaries build without it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "tch-backend")]
//! # fn main() -> split_policy::PolicyResult<()> {
//! use split_policy::{PolicyConfig, PolicyNetwork, SplitBounds};
//! use tch::{Device, Kind, Tensor};
//!
//! let config = PolicyConfig::default();
//! let network = PolicyNetwork::new(&config, Device::Cpu)?;
//!
//! let images = Tensor::rand([2, 256, 256, 1], (Kind::Float, Device::Cpu));
//! let mask = Tensor::ones([2, 4], (Kind::Float, Device::Cpu));
//! let action = network.act(&images, &mask, &SplitBounds::unit(2, Device::Cpu))?;
//! println!("rules: {:?}", action.rules);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "tch-backend"))]
//! # fn main() {}
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod summary;

#[cfg(feature = "tch-backend")]
pub mod distributions;
#[cfg(feature = "tch-backend")]
pub mod losses;
#[cfg(feature = "tch-backend")]
pub mod model;
#[cfg(feature = "tch-backend")]
pub mod rule_head;
#[cfg(feature = "tch-backend")]
pub mod split_head;
#[cfg(feature = "tch-backend")]
pub mod trainer;
#[cfg(feature = "tch-backend")]
pub mod trunk;

// Convenient re-exports at the crate root.
pub use checkpoint::{CheckpointId, CheckpointManager, RestoreReport, ShapeMismatchEntry};
pub use config::{EmptyMaskPolicy, OptimizerKind, PolicyConfig};
pub use error::{CheckpointError, ConfigError, PolicyError, PolicyResult};
pub use summary::{ScalarSummaries, SummaryWriter};

#[cfg(feature = "tch-backend")]
pub use model::{PolicyAction, PolicyNetwork, PolicyOutput};
#[cfg(feature = "tch-backend")]
pub use split_head::SplitBounds;
#[cfg(feature = "tch-backend")]
pub use trainer::{clip_gradients_by_norm, ClipStats, StepOutput, Trainer, TrainingBatch};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
