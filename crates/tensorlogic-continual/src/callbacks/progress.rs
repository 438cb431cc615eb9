//! Forwarding epoch progress to an observer.

use crate::callbacks::core::Callback;
use crate::model::Model;
use crate::{ContinualResult, TrainingState};

/// Observer invoked after every epoch.
pub type ProgressFn = Box<dyn FnMut(&TrainingState) + Send>;

/// Callback that hands each finished epoch to a closure.
pub struct ProgressCallback {
    observer: ProgressFn,
}

impl ProgressCallback {
    /// Create a progress callback.
    pub fn new(observer: impl FnMut(&TrainingState) + Send + 'static) -> Self {
        Self {
            observer: Box::new(observer),
        }
    }
}

impl Callback for ProgressCallback {
    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        state: &TrainingState,
        _model: &mut dyn Model,
    ) -> ContinualResult<()> {
        (self.observer)(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequentialModel;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_observer_sees_each_epoch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut callback = ProgressCallback::new(move |state: &TrainingState| {
            sink.lock().push(state.epoch);
        });

        let mut model = SequentialModel::new("head");
        let mut state = TrainingState::default();
        for epoch in 0..3 {
            state.epoch = epoch;
            callback.on_epoch_end(epoch, &state, &mut model).unwrap();
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
