//! Core callback infrastructure for training.

use crate::model::Model;
use crate::{ContinualResult, TrainingState};
use tracing::info;

/// Trait for training callbacks.
///
/// Hooks that may change which parameters train receive the model.
pub trait Callback {
    /// Called at the beginning of training.
    fn on_train_begin(&mut self, _state: &TrainingState, _model: &mut dyn Model) -> ContinualResult<()> {
        Ok(())
    }

    /// Called at the end of training.
    fn on_train_end(&mut self, _state: &TrainingState, _model: &mut dyn Model) -> ContinualResult<()> {
        Ok(())
    }

    /// Called at the beginning of an epoch.
    fn on_epoch_begin(&mut self, _epoch: usize, _state: &TrainingState) -> ContinualResult<()> {
        Ok(())
    }

    /// Called at the end of an epoch, after the engine reported.
    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _state: &TrainingState,
        _model: &mut dyn Model,
    ) -> ContinualResult<()> {
        Ok(())
    }

    /// Check if training should stop early.
    fn should_stop(&self) -> bool {
        false
    }
}

/// List of callbacks to execute in order.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackList {
    /// Create a new callback list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback to the list.
    pub fn add(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Execute on_train_begin for all callbacks.
    pub fn on_train_begin(&mut self, state: &TrainingState, model: &mut dyn Model) -> ContinualResult<()> {
        for callback in &mut self.callbacks {
            callback.on_train_begin(state, model)?;
        }
        Ok(())
    }

    /// Execute on_train_end for all callbacks.
    pub fn on_train_end(&mut self, state: &TrainingState, model: &mut dyn Model) -> ContinualResult<()> {
        for callback in &mut self.callbacks {
            callback.on_train_end(state, model)?;
        }
        Ok(())
    }

    /// Execute on_epoch_begin for all callbacks.
    pub fn on_epoch_begin(&mut self, epoch: usize, state: &TrainingState) -> ContinualResult<()> {
        for callback in &mut self.callbacks {
            callback.on_epoch_begin(epoch, state)?;
        }
        Ok(())
    }

    /// Execute on_epoch_end for all callbacks.
    pub fn on_epoch_end(
        &mut self,
        epoch: usize,
        state: &TrainingState,
        model: &mut dyn Model,
    ) -> ContinualResult<()> {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(epoch, state, model)?;
        }
        Ok(())
    }

    /// Check if any callback requests early stopping.
    pub fn should_stop(&self) -> bool {
        self.callbacks.iter().any(|cb| cb.should_stop())
    }
}

/// Callback that logs epoch results.
pub struct EpochCallback {
    /// Tag attached to every event.
    pub run: String,
}

impl EpochCallback {
    /// Create a new epoch callback.
    pub fn new(run: impl Into<String>) -> Self {
        Self { run: run.into() }
    }
}

impl Callback for EpochCallback {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        state: &TrainingState,
        model: &mut dyn Model,
    ) -> ContinualResult<()> {
        info!(
            run = self.run.as_str(),
            epoch = epoch + 1,
            total = state.total_epochs,
            metric = state.val_metric.unwrap_or(f64::NAN),
            trainable = model.num_trainable_parameters(),
            "epoch finished"
        );
        Ok(())
    }
}
