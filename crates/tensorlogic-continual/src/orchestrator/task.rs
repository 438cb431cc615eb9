//! Training task records and their lifecycle.
//!
//! ```text
//! pending --start--> running --+--> completed
//!    |                         +--> failed
//!    +--------cancel-----------+--> cancelled
//! ```
//!
//! Terminal records never change again: every mutator checks the status
//! first and reports whether it applied.

use crate::config::{TrainingConfig, TrainingType};
use crate::logging::TaskLog;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

/// Lifecycle status of a training task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not started.
    Pending,
    /// A worker is training.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker hands back when training succeeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingOutcome {
    /// Best checkpoint of the run, or the final artifact.
    pub result_path: PathBuf,
    /// Summary metrics.
    pub metrics: BTreeMap<String, f64>,
}

/// One training job.
#[derive(Debug, Clone)]
pub struct TrainingTask {
    id: String,
    training_type: TrainingType,
    config: TrainingConfig,
    status: TaskStatus,
    created_at: DateTime<Local>,
    started_at: Option<DateTime<Local>>,
    completed_at: Option<DateTime<Local>>,
    progress: f64,
    current_epoch: usize,
    total_epochs: usize,
    log: TaskLog,
    error: Option<String>,
    result_path: Option<PathBuf>,
    metrics: BTreeMap<String, f64>,
}

impl TrainingTask {
    /// Create a pending task.
    pub fn new(id: impl Into<String>, training_type: TrainingType, config: TrainingConfig) -> Self {
        let total_epochs = config.epochs;
        let mut task = Self {
            id: id.into(),
            training_type,
            config,
            status: TaskStatus::Pending,
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            current_epoch: 0,
            total_epochs,
            log: TaskLog::new(),
            error: None,
            result_path: None,
            metrics: BTreeMap::new(),
        };
        task.log(format!("Task created: {}", training_type));
        task
    }

    /// Task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Training type.
    pub fn training_type(&self) -> TrainingType {
        self.training_type
    }

    /// Training configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// Log lines so far.
    pub fn logs(&self) -> &[String] {
        self.log.lines()
    }

    /// Append a log line and emit it through `tracing`.
    ///
    /// Returns `false` once the task is terminal.
    pub fn log(&mut self, message: impl AsRef<str>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let message = message.as_ref();
        info!(task_id = %self.id, "{}", message);
        self.log.push(message);
        true
    }

    /// pending -> running.
    pub fn mark_running(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Local::now());
        self.log("Training started");
        true
    }

    /// Record the end of an epoch.
    pub fn update_progress(&mut self, epoch: usize, total_epochs: usize) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.current_epoch = epoch;
        self.total_epochs = total_epochs;
        self.progress = if total_epochs > 0 {
            (epoch as f64 / total_epochs as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        true
    }

    /// running -> completed.
    pub fn complete(&mut self, outcome: TrainingOutcome) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.log(format!(
            "Training completed, result: {}",
            outcome.result_path.display()
        ));
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Local::now());
        self.progress = 1.0;
        self.result_path = Some(outcome.result_path);
        self.metrics = outcome.metrics;
        true
    }

    /// running -> failed.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        let error = error.into();
        self.log(format!("Training failed: {}", error));
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Local::now());
        self.error = Some(error);
        true
    }

    /// pending|running -> cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.log("Training cancelled");
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Local::now());
        true
    }

    /// Serializable snapshot.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            training_type: self.training_type,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            current_epoch: self.current_epoch,
            total_epochs: self.total_epochs,
            logs: self.log.lines().to_vec(),
            error: self.error.clone(),
            result_path: self.result_path.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        }
    }
}

/// Point-in-time copy of a task for pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task id.
    pub id: String,
    /// Training type.
    pub training_type: TrainingType,
    /// Status.
    pub status: TaskStatus,
    /// Creation time.
    pub created_at: DateTime<Local>,
    /// When the worker started.
    pub started_at: Option<DateTime<Local>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Local>>,
    /// Fraction of epochs finished, in `[0, 1]`.
    pub progress: f64,
    /// Epochs finished.
    pub current_epoch: usize,
    /// Epoch budget.
    pub total_epochs: usize,
    /// Timestamped log lines.
    pub logs: Vec<String>,
    /// Failure message.
    pub error: Option<String>,
    /// Result checkpoint.
    pub result_path: Option<PathBuf>,
    /// Summary metrics.
    pub metrics: BTreeMap<String, f64>,
    /// Training configuration.
    pub config: TrainingConfig,
}
