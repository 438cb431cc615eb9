//! Interface to the external model training engine.
//!
//! The engine owns the forward/backward pass, the optimizer and image
//! decoding. The orchestration layer drives it one epoch at a time, so that
//! cancellation, early stopping and freeze-stage transitions happen between
//! epochs.

use crate::config::{ModelSize, TaskKind, TrainingConfig};
use crate::model::Model;
use crate::objective::Objective;
use crate::reconcile::{DatasetView, ReplayBuffer};
use crate::ContinualResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where the engine should take a model from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    /// Stock pretrained weights for a task kind and size.
    Pretrained {
        /// Task family.
        task: TaskKind,
        /// Size class.
        size: ModelSize,
    },
    /// A saved checkpoint.
    Checkpoint(PathBuf),
}

/// Per-run hyperparameters passed to every epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Task family.
    pub task: TaskKind,
    /// Total epochs of the run.
    pub epochs: usize,
    /// Batch size.
    pub batch: usize,
    /// Input image size.
    pub image_size: usize,
    /// Fraction of each batch replaced by replay samples.
    pub replay_ratio: f64,
    /// Seed for engine-side randomness.
    pub seed: Option<u64>,
}

impl Hyperparameters {
    /// Hyperparameters of a training config.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            task: config.task,
            epochs: config.epochs,
            batch: config.batch,
            image_size: config.image_size,
            replay_ratio: config.replay.ratio,
            seed: config.seed,
        }
    }
}

/// Everything the engine needs to run one epoch.
pub struct EpochContext<'a> {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Dataset to train and validate on.
    pub dataset: &'a DatasetView,
    /// Hyperparameters.
    pub hyper: &'a Hyperparameters,
    /// Student model; trainability flags are set by the caller.
    pub model: &'a mut dyn Model,
    /// Frozen teacher, when the objective needs one.
    pub teacher: Option<&'a dyn Model>,
    /// Per-batch loss hook.
    pub objective: &'a dyn Objective,
    /// Old samples to mix into batches.
    pub replay: Option<&'a ReplayBuffer>,
    /// Directory for checkpoints and engine output.
    pub run_dir: &'a Path,
}

/// What the engine reports after an epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Epoch index.
    pub epoch: usize,
    /// Validation metric; lower is better.
    pub metric: f64,
    /// Checkpoint written for this epoch.
    pub checkpoint: Option<PathBuf>,
    /// Gradient norm of the trainable parameters.
    pub grad_norm: Option<f64>,
    /// Additional metrics.
    pub metrics: BTreeMap<String, f64>,
}

impl EpochReport {
    /// Report with only a metric.
    pub fn new(epoch: usize, metric: f64) -> Self {
        Self {
            epoch,
            metric,
            checkpoint: None,
            grad_norm: None,
            metrics: BTreeMap::new(),
        }
    }

    /// Attach a checkpoint path.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Attach a gradient norm.
    pub fn with_grad_norm(mut self, norm: f64) -> Self {
        self.grad_norm = Some(norm);
        self
    }

    /// Attach an extra metric.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Model training engine.
pub trait TrainingEngine: Send + Sync {
    /// Load a model.
    fn load_model(&self, source: &ModelSource) -> ContinualResult<Box<dyn Model>>;

    /// Train and validate for one epoch.
    fn run_epoch(&self, ctx: EpochContext<'_>) -> ContinualResult<EpochReport>;
}
