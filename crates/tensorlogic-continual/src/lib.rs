//! Continual-learning training orchestration.
//!
//! **Version**: 0.1.0-alpha.2 | **Status**: Alpha
//!
//! This crate retrains vision models as new data and new classes arrive
//! without forgetting the old ones. The forward/backward pass lives in an
//! external [`TrainingEngine`]; this crate decides what the engine trains on
//! and how:
//! - Task orchestration: concurrent, cancellable training jobs with polling
//! - Freeze-stage scheduling: plateau-driven progressive unfreezing
//! - Label-space reconciliation: merged class lists, mixed datasets, head adaptation
//! - Distillation objectives: teacher/student loss composition with replay
//! - A generic epoch loop with callbacks
//! - Logging via `tracing`, with an optional subscriber builder

pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod freeze;
pub mod logging;
pub mod model;
pub mod objective;
pub mod orchestrator;
pub mod reconcile;
pub mod trainer;

pub use callbacks::{
    Callback, CallbackList, EarlyStoppingCallback, EpochCallback, ProgressCallback,
};
pub use config::{
    DistillationSettings, MaterializeMode, ModelSize, OrchestratorConfig, ReplaySettings,
    TaskKind, TrainingConfig, TrainingType,
};
pub use engine::{EpochContext, EpochReport, Hyperparameters, ModelSource, TrainingEngine};
pub use error::{ContinualError, ContinualResult};
pub use freeze::{
    CheckpointCompression, FreezeCallback, FreezeScheduler, FreezeSettings, FreezeStatus,
    StageTransition, StageWeightStore,
};
pub use logging::TaskLog;
pub use model::{ClassificationHead, Model, ModelArtifact, SequentialModel};
pub use objective::{
    Batch, DistillationObjective, GroundTruthObjective, LossBreakdown, ModelOutput, Objective,
    TeacherAlignment,
};
pub use orchestrator::{Orchestrator, TaskStatus, TaskView};
pub use reconcile::{
    adapt_model, build_mixed_dataset, DatasetView, LabelSpaceMapping, ReplayBuffer, Taxonomy,
};
pub use trainer::{Trainer, TrainingHistory, TrainingInputs, TrainingState};

#[cfg(feature = "structured-logging")]
pub use logging::{LogFormat, LogLevel, TracingLogger, TracingLoggerBuilder};
