//! Main training loop implementation.
//!
//! One loop serves every training type: the engine runs one epoch per call,
//! and the strategy-specific behaviour comes from the injected objective and
//! callbacks.

use crate::callbacks::CallbackList;
use crate::engine::{EpochContext, EpochReport, Hyperparameters, TrainingEngine};
use crate::model::Model;
use crate::objective::Objective;
use crate::reconcile::{DatasetView, ReplayBuffer};
use crate::ContinualResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Training state passed to callbacks.
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    /// Current epoch number (zero-based).
    pub epoch: usize,
    /// Total epochs of the run.
    pub total_epochs: usize,
    /// Validation metric of the last epoch.
    pub val_metric: Option<f64>,
    /// Lowest validation metric so far.
    pub best_metric: Option<f64>,
    /// Checkpoint reported for the last epoch.
    pub checkpoint: Option<PathBuf>,
    /// Gradient norm reported for the last epoch.
    pub grad_norm: Option<f64>,
    /// Additional metrics of the last epoch.
    pub metrics: BTreeMap<String, f64>,
    /// Whether cancellation was requested.
    pub cancelled: bool,
}

/// Inputs shared by every epoch of a run.
pub struct TrainingInputs<'a> {
    /// Dataset to train on.
    pub dataset: &'a DatasetView,
    /// Frozen teacher.
    pub teacher: Option<&'a dyn Model>,
    /// Per-batch loss hook.
    pub objective: &'a dyn Objective,
    /// Replay buffer.
    pub replay: Option<&'a ReplayBuffer>,
    /// Run output directory.
    pub run_dir: &'a Path,
}

/// Main trainer driving an engine epoch by epoch.
pub struct Trainer<'e> {
    engine: &'e dyn TrainingEngine,
    hyper: Hyperparameters,
    callbacks: CallbackList,
    cancel: Arc<AtomicBool>,
    state: TrainingState,
}

impl<'e> Trainer<'e> {
    /// Create a new trainer.
    pub fn new(engine: &'e dyn TrainingEngine, hyper: Hyperparameters) -> Self {
        Self {
            engine,
            hyper,
            callbacks: CallbackList::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            state: TrainingState::default(),
        }
    }

    /// Set callbacks.
    pub fn with_callbacks(mut self, callbacks: CallbackList) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Set the cooperative cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Train until the epoch budget is spent, a callback asks to stop, or
    /// cancellation is requested. An epoch handed to the engine always runs
    /// to completion.
    pub fn train(
        &mut self,
        model: &mut dyn Model,
        inputs: &TrainingInputs<'_>,
    ) -> ContinualResult<TrainingHistory> {
        let mut history = TrainingHistory::new();
        self.state.total_epochs = self.hyper.epochs;

        self.callbacks.on_train_begin(&self.state, model)?;

        for epoch in 0..self.hyper.epochs {
            if self.is_cancelled() {
                info!(epoch, "cancellation requested, stopping before epoch");
                self.state.cancelled = true;
                history.cancelled = true;
                break;
            }
            self.state.epoch = epoch;
            self.callbacks.on_epoch_begin(epoch, &self.state)?;

            let report = self.engine.run_epoch(EpochContext {
                epoch,
                dataset: inputs.dataset,
                hyper: &self.hyper,
                model: &mut *model,
                teacher: inputs.teacher,
                objective: inputs.objective,
                replay: inputs.replay,
                run_dir: inputs.run_dir,
            })?;
            debug!(epoch, metric = report.metric, "engine reported epoch");

            self.state.val_metric = Some(report.metric);
            self.state.best_metric = Some(
                self.state
                    .best_metric
                    .map_or(report.metric, |best| best.min(report.metric)),
            );
            self.state.checkpoint = report.checkpoint.clone();
            self.state.grad_norm = report.grad_norm;
            self.state.metrics = report.metrics.clone();
            self.state.cancelled = self.is_cancelled();
            history.record(report);

            self.callbacks.on_epoch_end(epoch, &self.state, model)?;

            if self.callbacks.should_stop() {
                info!(epoch = epoch + 1, "training stopped by callback");
                history.stopped_early = true;
                break;
            }
        }

        self.callbacks.on_train_end(&self.state, model)?;
        Ok(history)
    }

    /// Get current training state.
    pub fn get_state(&self) -> &TrainingState {
        &self.state
    }
}

/// Training history containing the engine's epoch reports.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    /// Reports in epoch order.
    pub reports: Vec<EpochReport>,
    /// Validation metric per epoch.
    pub val_metrics: Vec<f64>,
    /// Metrics per epoch.
    pub metrics: BTreeMap<String, Vec<f64>>,
    /// Whether a callback ended training before the budget was spent.
    pub stopped_early: bool,
    /// Whether the loop stopped because of cancellation.
    pub cancelled: bool,
}

impl TrainingHistory {
    /// Create a new training history.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, report: EpochReport) {
        self.val_metrics.push(report.metric);
        for (name, value) in &report.metrics {
            self.metrics.entry(name.clone()).or_default().push(*value);
        }
        self.reports.push(report);
    }

    /// Number of epochs run.
    pub fn epochs_run(&self) -> usize {
        self.reports.len()
    }

    /// Get best validation metric and corresponding epoch.
    pub fn best_val_metric(&self) -> Option<(usize, f64)> {
        self.val_metrics
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, &metric)| (idx, metric))
    }

    /// Checkpoint of the lowest-metric epoch among those that wrote one.
    pub fn best_checkpoint(&self) -> Option<&Path> {
        self.reports
            .iter()
            .filter_map(|r| r.checkpoint.as_deref().map(|c| (r.metric, c)))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, c)| c)
    }

    /// Last epoch's report.
    pub fn last(&self) -> Option<&EpochReport> {
        self.reports.last()
    }

    /// Get metric history.
    pub fn get_metric_history(&self, metric_name: &str) -> Option<&Vec<f64>> {
        self.metrics.get(metric_name)
    }
}
