//! Concurrent lifecycle management of training tasks.
//!
//! Each started task runs on its own named OS thread, tracked until it exits
//! or the task is cancelled. Status polling only
//! takes read locks on the task record, so it stays cheap while workers are
//! training. Cancellation is cooperative: the record turns `cancelled` at
//! once, and the worker stops before its next epoch.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tensorlogic_continual::config::{OrchestratorConfig, TrainingConfig, TrainingType};
//! use tensorlogic_continual::engine::TrainingEngine;
//! use tensorlogic_continual::orchestrator::Orchestrator;
//!
//! fn launch(engine: Arc<dyn TrainingEngine>) {
//!     let orchestrator = Orchestrator::new(engine, OrchestratorConfig::load_default());
//!     let id = orchestrator.create(TrainingType::Regular, TrainingConfig::default());
//!     orchestrator.start(&id);
//!     if let Some(view) = orchestrator.get(&id) {
//!         println!("{} is {}", view.id, view.status);
//!     }
//! }
//! ```

pub mod registry;
pub mod task;
pub mod worker;

pub use registry::{TaskHandle, TaskRegistry};
pub use task::{TaskStatus, TaskView, TrainingOutcome, TrainingTask};
pub use worker::{initial_source, resolve_seed, run_task, WorkerContext, FINAL_ARTIFACT};

use crate::config::{OrchestratorConfig, TrainingConfig, TrainingType};
use crate::engine::TrainingEngine;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Creates, starts, cancels and reports on training tasks.
pub struct Orchestrator {
    engine: Arc<dyn TrainingEngine>,
    settings: Arc<OrchestratorConfig>,
    registry: TaskRegistry,
}

impl Orchestrator {
    /// Create an orchestrator driving `engine`.
    pub fn new(engine: Arc<dyn TrainingEngine>, settings: OrchestratorConfig) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            registry: TaskRegistry::new(),
        }
    }

    /// Orchestrator settings.
    pub fn settings(&self) -> &OrchestratorConfig {
        &self.settings
    }

    /// Register a pending task and return its id.
    pub fn create(&self, training_type: TrainingType, config: TrainingConfig) -> String {
        let handle = self.registry.insert(training_type, config);
        let id = handle.record.read().id().to_string();
        id
    }

    /// Start a pending task on a worker thread.
    ///
    /// Returns `false` when the task does not exist or is not pending.
    pub fn start(&self, id: &str) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };
        let (training_type, config) = {
            let mut task = handle.record.write();
            if !task.mark_running() {
                return false;
            }
            (task.training_type(), task.config().clone())
        };

        let ctx = WorkerContext {
            task_id: id.to_string(),
            training_type,
            config,
            engine: Arc::clone(&self.engine),
            settings: Arc::clone(&self.settings),
            record: Arc::clone(&handle.record),
            cancel: Arc::clone(&handle.cancel),
        };
        match self.registry.spawn_worker(id, move || run_worker(ctx)) {
            Ok(()) => true,
            Err(e) => {
                error!(task_id = id, error = %e, "failed to spawn worker");
                handle
                    .record
                    .write()
                    .fail(format!("Failed to spawn worker thread: {}", e));
                false
            }
        }
    }

    /// Cancel a pending or running task.
    ///
    /// The record becomes `cancelled` immediately and the worker is no longer
    /// tracked; a running worker finishes its current epoch and then stops
    /// without touching the record.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };
        if !handle.record.write().cancel() {
            return false;
        }
        handle.cancel.store(true, Ordering::SeqCst);
        if self.registry.take_worker(id).is_some() {
            debug!(task_id = id, "detached cancelled worker");
        }
        true
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<TaskView> {
        self.registry.get(id).map(|h| h.record.read().view())
    }

    /// Snapshots of all tasks, oldest first.
    pub fn list(&self) -> Vec<TaskView> {
        let mut views: Vec<TaskView> = self
            .registry
            .handles()
            .iter()
            .map(|h| h.record.read().view())
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        views
    }

    /// Log lines of one task.
    pub fn get_logs(&self, id: &str) -> Option<Vec<String>> {
        self.registry
            .get(id)
            .map(|h| h.record.read().logs().to_vec())
    }

    /// Wait for the worker of a task to exit.
    ///
    /// A terminal task whose worker is no longer tracked counts as finished.
    /// Returns `false` for unknown tasks and for tasks that never started.
    pub fn join(&self, id: &str) -> bool {
        if let Some(worker) = self.registry.take_worker(id) {
            if worker.join().is_err() {
                warn!(task_id = id, "worker thread panicked");
            }
            return true;
        }
        self.registry
            .get(id)
            .is_some_and(|h| h.record.read().status().is_terminal())
    }

    /// Number of worker threads still tracked.
    pub fn tracked_workers(&self) -> usize {
        self.registry.worker_count()
    }

    /// Number of tasks currently running.
    pub fn running_count(&self) -> usize {
        self.registry
            .handles()
            .iter()
            .filter(|h| h.record.read().status() == TaskStatus::Running)
            .count()
    }
}

fn run_worker(ctx: WorkerContext) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| run_task(&ctx)));
    let mut task = ctx.record.write();
    match result {
        Ok(Ok(outcome)) => {
            task.complete(outcome);
        }
        Ok(Err(e)) => {
            error!(task_id = %ctx.task_id, error = %e, "training failed");
            task.fail(e.to_string());
        }
        Err(_) => {
            error!(task_id = %ctx.task_id, "training worker panicked");
            task.fail("training worker panicked");
        }
    }
}
