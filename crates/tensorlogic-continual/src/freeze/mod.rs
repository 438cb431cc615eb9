//! Freeze-stage scheduling: which parameter groups train, and when.

pub mod callback;
pub mod plan;
pub mod scheduler;
pub mod store;

pub use callback::FreezeCallback;
pub use plan::{default_stage_plan, resolve_stage_plan, DEFAULT_NUM_BLOCKS};
pub use scheduler::{
    FreezeScheduler, FreezeSettings, FreezeStatus, ResumeInfo, SchedulerState, StageTransition,
};
pub use store::{
    CheckpointCompression, StageArtifact, StageWeightKind, StageWeightStore, StoredStage,
};
