//! `train` binary: drives the split policy through synthetic episodes.
//!
//! # Usage
//!
//! ```bash
//! cargo run --features tch-backend --bin train -- --epochs 3
//! cargo run --features tch-backend --bin train -- --config policy.json --resume
//! cargo run --features tch-backend --bin train -- --pretrained saved_models/model_epoch4.ot --cuda
//! ```
//!
//! Each episode draws random images and rule masks (rule 0 is always
//! allowed), samples a rule and a split from the current policy, and rewards
//! splits close to the image centre. The reward minus its batch mean is used
//! as the return weight for both heads.

use std::path::PathBuf;

use clap::Parser;
use tch::{Device, Kind, Tensor};
use tracing::{error, info, warn};

use split_policy::{
    CheckpointManager, PolicyConfig, PolicyError, PolicyNetwork, PolicyResult, SplitBounds,
    SummaryWriter, Trainer, TrainingBatch,
};

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Rule/split policy training on synthetic episodes",
    long_about = None
)]
struct Args {
    /// Path to a JSON configuration file.
    ///
    /// If not provided, the default `PolicyConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Warm-start from this checkpoint (shape-matched restore).
    #[arg(long, value_name = "FILE", conflicts_with = "resume")]
    pretrained: Option<PathBuf>,

    /// Continue from the latest checkpoint in the checkpoint directory.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Override the checkpoint directory from the config.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Override the learning rate from the config.
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Number of epochs to run.
    #[arg(long, default_value_t = 2)]
    epochs: usize,

    /// Training steps per epoch.
    #[arg(long, default_value_t = 50)]
    steps_per_epoch: usize,

    /// Episodes per training step (at least 1).
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(i64).range(1..))]
    batch_size: i64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("Split policy training v{}", split_policy::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match PolicyConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            PolicyConfig::default()
        }
    };

    if let Some(dir) = args.checkpoint_dir.clone() {
        config.checkpoint_dir = dir;
    }
    if args.cuda {
        config.use_gpu = true;
    }
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("  image size    : {}", config.image_size);
    info!("  rules         : {}", config.num_rules);
    info!("  optimizer     : {:?}", config.optimizer);
    info!("  learning rate : {}", config.learning_rate);
    info!("  clip norm     : {}", config.grad_clip_norm);

    if let Err(e) = run(&args, &config) {
        error!("Training failed: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args, config: &PolicyConfig) -> PolicyResult<()> {
    tch::manual_seed(config.seed as i64);
    let device = config.device();
    let checkpoints = CheckpointManager::new(&config.checkpoint_dir);
    info!("  checkpoints   : {}", checkpoints.dir().display());

    let (warm_start, first_epoch) = if args.resume {
        match checkpoints.latest()? {
            Some((id, path)) => {
                info!("Resuming from {} ({:?})", path.display(), id);
                let next = if id.iteration.is_some() { id.epoch } else { id.epoch + 1 };
                (Some(path), next)
            }
            None => {
                warn!("--resume given but no checkpoint found; starting fresh");
                (None, 0)
            }
        }
    } else {
        (args.pretrained.clone(), 0)
    };

    let (mut network, report) = PolicyNetwork::create(config, device, warm_start.as_deref())?;
    if let Some(report) = report {
        info!(
            "Restored {} variables, skipped {}",
            report.restored.len(),
            report.num_skipped()
        );
    }
    info!("Network: {} trainable parameters on {:?}", network.num_parameters(), device);

    config.to_json(&checkpoints.dir().join("config.json"))?;

    let mut trainer = Trainer::new(&network)?.with_summary_writer(SummaryWriter::create(&config.log_dir)?);

    for epoch in first_epoch..first_epoch + args.epochs {
        let mut epoch_loss = 0.0;
        let mut epoch_reward = 0.0;
        let mut completed = 0_usize;
        let mut skipped = 0_usize;
        for _ in 0..args.steps_per_epoch {
            let (batch, mean_reward) = synthetic_episode(&network, args.batch_size, device)?;
            match trainer.step(&mut network, &batch) {
                Ok(out) => {
                    epoch_loss += out.total_loss;
                    epoch_reward += mean_reward;
                    completed += 1;
                }
                Err(PolicyError::NonFiniteStep { .. }) => skipped += 1,
                Err(e) => return Err(e),
            }
        }
        let steps = completed.max(1) as f64;
        info!(
            "Epoch {epoch}: mean loss {:.4}, mean reward {:.4}, skipped {skipped} batches",
            epoch_loss / steps,
            epoch_reward / steps
        );
        checkpoints.save(network.var_store(), epoch, None)?;
    }

    info!("Training finished after {} steps", trainer.steps());
    Ok(())
}

/// Roll out one batch of single-decision episodes under the current policy.
///
/// Returns the batch together with the mean raw reward.
fn synthetic_episode(
    network: &PolicyNetwork,
    batch_size: i64,
    device: Device,
) -> PolicyResult<(TrainingBatch, f64)> {
    let config = network.config();
    let size = config.image_size as i64;
    let channels = config.num_channels as i64;
    let num_rules = config.num_rules as i64;
    let opts = (Kind::Float, device);

    let images = Tensor::rand([batch_size, size, size, channels], opts);

    let mut always_allowed = vec![0.0_f32; config.num_rules];
    always_allowed[0] = 1.0;
    let always_allowed = Tensor::from_slice(&always_allowed).to_device(device);
    let rule_mask = Tensor::rand([batch_size, num_rules], opts)
        .gt(0.5)
        .to_kind(Kind::Float)
        .maximum(&always_allowed);

    let lower = Tensor::rand([batch_size, 1], opts) * 0.3;
    let upper = Tensor::rand([batch_size, 1], opts) * 0.3 + 0.7;
    let bounds = SplitBounds::new(&lower, &upper)?;

    let action = network.act(&images, &rule_mask, &bounds)?;

    let reward = (&action.splits - 0.5).square() * -4.0 + 1.0;
    let mean_reward = reward.mean(Kind::Float).double_value(&[]);
    let advantage = &reward - mean_reward;

    let batch = TrainingBatch {
        images,
        rule_mask,
        target_rule: action.rules.one_hot(num_rules).to_kind(Kind::Float),
        rule_return_weight: advantage.shallow_clone(),
        bounds,
        sampled_split: action.splits,
        split_return_weight: advantage,
    };
    Ok((batch, mean_reward))
}
