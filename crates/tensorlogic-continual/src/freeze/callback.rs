//! Driving the freeze scheduler from the training loop.

use crate::callbacks::Callback;
use crate::freeze::scheduler::{FreezeScheduler, StageTransition};
use crate::model::Model;
use crate::{ContinualResult, TrainingState};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Callback that feeds every epoch's metric to a shared [`FreezeScheduler`].
///
/// Training stops once the schedule is complete. When cancellation has been
/// requested, the epoch is not observed and no transition is applied.
pub struct FreezeCallback {
    scheduler: Arc<Mutex<FreezeScheduler>>,
    finished: bool,
}

impl FreezeCallback {
    /// Wrap a shared scheduler.
    pub fn new(scheduler: Arc<Mutex<FreezeScheduler>>) -> Self {
        Self {
            scheduler,
            finished: false,
        }
    }
}

impl Callback for FreezeCallback {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        state: &TrainingState,
        model: &mut dyn Model,
    ) -> ContinualResult<()> {
        if state.cancelled {
            return Ok(());
        }
        let Some(metric) = state.val_metric else {
            return Ok(());
        };

        let mut scheduler = self.scheduler.lock();
        if let Some(norm) = state.grad_norm {
            scheduler.record_grad_norm(norm);
        }
        match scheduler.step_epoch(metric, state.checkpoint.as_deref(), model)? {
            StageTransition::Stayed => {}
            StageTransition::Advanced { from, to } => {
                info!(epoch = epoch + 1, from, to, "freeze stage advanced");
            }
            StageTransition::Completed => {
                info!(epoch = epoch + 1, "freeze schedule complete, ending training");
                self.finished = true;
            }
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.finished
    }
}
