//! Early stopping on the validation metric.

use crate::callbacks::core::Callback;
use crate::model::Model;
use crate::{ContinualResult, TrainingState};
use tracing::info;

/// Callback for early stopping based on the validation metric (lower is better).
pub struct EarlyStoppingCallback {
    /// Number of epochs with no improvement after which training will be stopped.
    pub patience: usize,
    /// Minimum change to qualify as an improvement.
    pub min_delta: f64,
    /// Best metric seen so far.
    best_metric: Option<f64>,
    /// Counter for epochs without improvement.
    wait: usize,
    /// Whether to stop training.
    stop_training: bool,
}

impl EarlyStoppingCallback {
    /// Create a new early stopping callback.
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best_metric: None,
            wait: 0,
            stop_training: false,
        }
    }

    /// Best metric seen so far.
    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }
}

impl Callback for EarlyStoppingCallback {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        state: &TrainingState,
        _model: &mut dyn Model,
    ) -> ContinualResult<()> {
        if let Some(metric) = state.val_metric {
            let improved = self
                .best_metric
                .map(|best| metric < best - self.min_delta)
                .unwrap_or(true);

            if improved {
                self.best_metric = Some(metric);
                self.wait = 0;
            } else {
                self.wait += 1;
                if self.wait >= self.patience {
                    info!(
                        epoch = epoch + 1,
                        patience = self.patience,
                        "early stopping (no improvement)"
                    );
                    self.stop_training = true;
                }
            }
        }

        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop_training
    }
}
