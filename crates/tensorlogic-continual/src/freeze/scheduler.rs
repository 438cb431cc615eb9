//! Plateau-driven progressive unfreezing.
//!
//! The scheduler walks an ordered list of parameter groups from the last
//! index down to index 0. Stage `i` trains groups `stages[i..]`; the stage
//! moves on once the validation metric (lower is better) plateaus, and after
//! stage 0 the schedule is complete.
//!
//! ```text
//! N-1 --plateau--> N-2 --plateau--> ... --plateau--> 0 --plateau--> done
//! ```

use crate::freeze::store::{StageArtifact, StageWeightKind, StageWeightStore};
use crate::model::{Model, ModelArtifact};
use crate::{ContinualError, ContinualResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum number of available groups listed in a validation error.
const MAX_LISTED_GROUPS: usize = 10;

/// Number of recent metrics reported by [`FreezeScheduler::status`].
const RECENT_METRICS: usize = 5;

/// Tunables of the plateau test and stage transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeSettings {
    /// Size of the metric window inspected for a plateau.
    pub patience: usize,
    /// Epochs a stage must train before it may end.
    pub min_epochs_per_stage: usize,
    /// Relative improvement below which the metric counts as flat.
    pub plateau_tolerance: f64,
    /// Reload the previous stage's best weights on entering a stage.
    pub auto_load_best: bool,
}

impl Default for FreezeSettings {
    fn default() -> Self {
        Self {
            patience: 3,
            min_epochs_per_stage: 15,
            plateau_tolerance: 0.005,
            auto_load_best: true,
        }
    }
}

/// Serializable scheduler progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Parameter group ids, index 0 joining last.
    pub stages: Vec<String>,
    /// Current stage; `None` once the schedule is complete.
    pub current_stage: Option<usize>,
    /// Epochs trained in each stage.
    pub stage_epochs: Vec<usize>,
    /// Lowest metric seen in each stage.
    pub stage_best_metrics: Vec<Option<f64>>,
    /// Every metric observed, in order.
    pub val_metrics: Vec<f64>,
    /// Gradient norms recorded per stage.
    pub grad_norm_history: Vec<Vec<f64>>,
    /// Total epochs observed.
    pub total_epochs: usize,
}

impl SchedulerState {
    /// Fresh state positioned at the last stage.
    pub fn new(stages: Vec<String>) -> Self {
        let n = stages.len();
        Self {
            current_stage: n.checked_sub(1),
            stage_epochs: vec![0; n],
            stage_best_metrics: vec![None; n],
            grad_norm_history: vec![Vec::new(); n],
            val_metrics: Vec::new(),
            total_epochs: 0,
            stages,
        }
    }

    /// Number of stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Whether every stage has been completed.
    pub fn is_complete(&self) -> bool {
        self.current_stage.is_none()
    }
}

/// Snapshot of the scheduler for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeStatus {
    /// Current stage index.
    pub current_stage: Option<usize>,
    /// Total stage count.
    pub total_stages: usize,
    /// Group id of the current stage.
    pub current_stage_name: Option<String>,
    /// Epochs in the current stage.
    pub stage_epochs: usize,
    /// Best metric of the current stage.
    pub stage_best_metric: Option<f64>,
    /// Total epochs observed.
    pub total_epochs: usize,
    /// Parameter count of the model.
    pub total_params: usize,
    /// Parameters receiving gradient updates.
    pub trainable_params: usize,
    /// `trainable_params / total_params`.
    pub trainable_ratio: f64,
    /// Number of metrics observed.
    pub val_metrics_count: usize,
    /// Up to the five most recent metrics.
    pub recent_metrics: Vec<f64>,
    /// Stages already left.
    pub completed_stages: usize,
    /// Stages still to train, including the current one.
    pub remaining_stages: usize,
    /// Completed stages as a percentage.
    pub progress_percentage: f64,
}

impl FreezeStatus {
    /// Numeric fields keyed for a task's metrics map.
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "freeze/current_stage".to_string(),
            self.current_stage.map_or(-1.0, |s| s as f64),
        );
        metrics.insert("freeze/total_stages".to_string(), self.total_stages as f64);
        metrics.insert("freeze/completed_stages".to_string(), self.completed_stages as f64);
        metrics.insert("freeze/trainable_params".to_string(), self.trainable_params as f64);
        metrics.insert("freeze/trainable_ratio".to_string(), self.trainable_ratio);
        metrics.insert("freeze/progress_percentage".to_string(), self.progress_percentage);
        metrics
    }
}

/// What a resumed run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    /// Stage to continue from.
    pub current_stage: Option<usize>,
    /// Epochs already completed.
    pub completed_epochs: usize,
    /// Epochs per stage.
    pub stage_epochs: Vec<usize>,
    /// Best metric per stage.
    pub best_metrics: Vec<Option<f64>>,
    /// Whether any stage remains.
    pub can_resume: bool,
}

/// Result of observing one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTransition {
    /// The current stage continues.
    Stayed,
    /// Moved from one stage to the next lower index.
    Advanced {
        /// Stage that ended.
        from: usize,
        /// Stage entered.
        to: usize,
    },
    /// Stage 0 ended; the schedule is complete.
    Completed,
}

/// Progressive unfreezing scheduler.
#[derive(Debug)]
pub struct FreezeScheduler {
    state: SchedulerState,
    settings: FreezeSettings,
    store: StageWeightStore,
    stage_changed: bool,
}

impl FreezeScheduler {
    /// Validate `stages` against `model` and apply the initial freeze.
    ///
    /// Every stage id must name a parameter group of the model.
    pub fn new(
        model: &mut dyn Model,
        stages: Vec<String>,
        settings: FreezeSettings,
        store: StageWeightStore,
    ) -> ContinualResult<Self> {
        if stages.is_empty() {
            return Err(ContinualError::InvalidParameter(
                "freeze stages cannot be empty".to_string(),
            ));
        }
        if settings.patience == 0 {
            return Err(ContinualError::InvalidParameter(
                "patience must be positive".to_string(),
            ));
        }
        validate_stages(model, &stages)?;

        let mut scheduler = Self {
            state: SchedulerState::new(stages),
            settings,
            store,
            stage_changed: true,
        };
        scheduler.apply_freeze(model);

        info!(
            stages = scheduler.state.num_stages(),
            current = ?scheduler.state.current_stage,
            group = scheduler.current_stage_name().unwrap_or_default(),
            "freeze scheduler initialized"
        );
        Ok(scheduler)
    }

    /// Freeze everything, then unfreeze the groups of the current stage.
    fn apply_freeze(&self, model: &mut dyn Model) {
        model.freeze_all();
        let Some(current) = self.state.current_stage else {
            return;
        };
        for group in &self.state.stages[current..] {
            let touched = model.set_group_trainable(group, true);
            debug!(group = group.as_str(), tensors = touched, "unfroze group");
        }
    }

    /// Observe the metric of a finished epoch.
    ///
    /// An improvement of the current stage's best metric saves the stage's
    /// `best` artifact. A plateau advances to the next stage.
    pub fn step_epoch(
        &mut self,
        metric: f64,
        checkpoint: Option<&Path>,
        model: &mut dyn Model,
    ) -> ContinualResult<StageTransition> {
        self.state.total_epochs += 1;
        self.state.val_metrics.push(metric);

        let Some(current) = self.state.current_stage else {
            return Ok(StageTransition::Stayed);
        };

        self.state.stage_epochs[current] += 1;
        let improved = self.state.stage_best_metrics[current].is_none_or(|best| metric < best);
        if improved {
            self.state.stage_best_metrics[current] = Some(metric);
            self.persist(current, StageWeightKind::Best, Some(metric), checkpoint, model);
        }

        info!(
            epoch = self.state.total_epochs,
            metric,
            stage = current,
            stage_epochs = self.state.stage_epochs[current],
            "freeze scheduler observed epoch"
        );

        if self.should_switch_stage() {
            return Ok(self.switch_to_next_stage(model));
        }
        Ok(StageTransition::Stayed)
    }

    /// Plateau test over the last `patience` metrics.
    fn should_switch_stage(&self) -> bool {
        let Some(current) = self.state.current_stage else {
            return false;
        };
        if self.state.stage_epochs[current] < self.settings.min_epochs_per_stage {
            return false;
        }
        let history = &self.state.val_metrics;
        if history.len() < self.settings.patience {
            return false;
        }
        let window = &history[history.len() - self.settings.patience..];
        let floor = window[0] * (1.0 - self.settings.plateau_tolerance);
        let plateau = window[1..].iter().all(|&m| m >= floor);
        if plateau {
            info!(stage = current, "stage reached plateau");
        }
        plateau
    }

    fn switch_to_next_stage(&mut self, model: &mut dyn Model) -> StageTransition {
        let Some(current) = self.state.current_stage else {
            return StageTransition::Stayed;
        };
        let last_metric = self.state.val_metrics.last().copied();
        self.persist(current, StageWeightKind::Last, last_metric, None, model);

        if current == 0 {
            self.state.current_stage = None;
            info!("all freeze stages completed");
            return StageTransition::Completed;
        }

        let next = current - 1;
        self.state.current_stage = Some(next);
        self.stage_changed = true;
        self.apply_freeze(model);

        info!(
            from = current,
            to = next,
            unfrozen = ?&self.state.stages[next..],
            remaining = next + 1,
            "freeze stage switched"
        );

        if self.settings.auto_load_best {
            self.load_previous_stage_best(model);
        }
        StageTransition::Advanced {
            from: current,
            to: next,
        }
    }

    /// Reload the best weights of the stage just left. Failures are logged.
    fn load_previous_stage_best(&self, model: &mut dyn Model) {
        let Some(current) = self.state.current_stage else {
            return;
        };
        let previous = current + 1;
        match self.store.load(previous, StageWeightKind::Best) {
            Ok(Some(artifact)) => match artifact.model.apply_to(model) {
                Ok(()) => info!(stage = previous, "loaded previous stage best weights"),
                Err(e) => warn!(stage = previous, error = %e, "failed to apply previous stage weights"),
            },
            Ok(None) => debug!(stage = previous, "no best weights saved for previous stage"),
            Err(e) => warn!(stage = previous, error = %e, "failed to load previous stage weights"),
        }
    }

    fn persist(
        &self,
        stage: usize,
        kind: StageWeightKind,
        metric: Option<f64>,
        checkpoint: Option<&Path>,
        model: &dyn Model,
    ) {
        let artifact = StageArtifact {
            stage,
            kind,
            epoch: self.state.total_epochs,
            metric,
            source_checkpoint: checkpoint.map(Path::to_path_buf),
            scheduler_state: self.state.clone(),
            model: ModelArtifact::from_model(model),
        };
        match self.store.save(&artifact) {
            Ok(path) => debug!(stage, kind = kind.as_str(), path = %path.display(), "saved stage weights"),
            Err(e) => warn!(stage, kind = kind.as_str(), error = %e, "failed to save stage weights"),
        }
    }

    /// Append a gradient norm to the current stage's history.
    pub fn record_grad_norm(&mut self, norm: f64) {
        if let Some(current) = self.state.current_stage {
            self.state.grad_norm_history[current].push(norm);
        }
    }

    /// Whether the stage changed since the last call (one-shot).
    pub fn is_stage_changed(&mut self) -> bool {
        std::mem::take(&mut self.stage_changed)
    }

    /// Current stage index.
    pub fn current_stage(&self) -> Option<usize> {
        self.state.current_stage
    }

    /// Group id of the current stage.
    pub fn current_stage_name(&self) -> Option<&str> {
        self.state
            .current_stage
            .map(|i| self.state.stages[i].as_str())
    }

    /// Whether every stage has been completed.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Scheduler state.
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Stage artifact store.
    pub fn store(&self) -> &StageWeightStore {
        &self.store
    }

    /// Current status, with parameter counts taken from `model`.
    pub fn status(&self, model: &dyn Model) -> FreezeStatus {
        let total_params = model.num_parameters();
        let trainable_params = model.num_trainable_parameters();
        let n = self.state.num_stages();
        let current = self.state.current_stage;
        let (completed_stages, remaining_stages) = match current {
            Some(i) => (n - i - 1, i + 1),
            None => (n, 0),
        };
        let metrics = &self.state.val_metrics;

        FreezeStatus {
            current_stage: current,
            total_stages: n,
            current_stage_name: self.current_stage_name().map(str::to_string),
            stage_epochs: current.map_or(0, |i| self.state.stage_epochs[i]),
            stage_best_metric: current.and_then(|i| self.state.stage_best_metrics[i]),
            total_epochs: self.state.total_epochs,
            total_params,
            trainable_params,
            trainable_ratio: if total_params > 0 {
                trainable_params as f64 / total_params as f64
            } else {
                0.0
            },
            val_metrics_count: metrics.len(),
            recent_metrics: metrics[metrics.len().saturating_sub(RECENT_METRICS)..].to_vec(),
            completed_stages,
            remaining_stages,
            progress_percentage: completed_stages as f64 / n as f64 * 100.0,
        }
    }

    /// Information needed to resume training.
    pub fn resume_info(&self) -> ResumeInfo {
        ResumeInfo {
            current_stage: self.state.current_stage,
            completed_epochs: self.state.total_epochs,
            stage_epochs: self.state.stage_epochs.clone(),
            best_metrics: self.state.stage_best_metrics.clone(),
            can_resume: self.state.current_stage.is_some(),
        }
    }

    /// Write the scheduler state as JSON.
    pub fn save_state(&self, path: &Path) -> ContinualResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state).map_err(|e| {
            ContinualError::Serialization(format!("Failed to serialize scheduler state: {}", e))
        })?;
        fs::write(path, json)?;
        info!(path = %path.display(), "saved freeze scheduler state");
        Ok(())
    }

    /// Restore state saved by [`save_state`](Self::save_state) and reapply
    /// the freeze pattern it describes to `model`.
    pub fn load_state(&mut self, path: &Path, model: &mut dyn Model) -> ContinualResult<()> {
        let json = fs::read_to_string(path).map_err(|e| {
            ContinualError::CheckpointError(format!(
                "Failed to read scheduler state {}: {}",
                path.display(),
                e
            ))
        })?;
        let state: SchedulerState = serde_json::from_str(&json).map_err(|e| {
            ContinualError::Serialization(format!("Failed to parse scheduler state: {}", e))
        })?;
        if state.stages != self.state.stages {
            return Err(ContinualError::ConfigError(format!(
                "Saved scheduler stages {:?} do not match {:?}",
                state.stages, self.state.stages
            )));
        }
        self.state = state;
        self.stage_changed = true;
        self.apply_freeze(model);
        info!(path = %path.display(), current = ?self.state.current_stage, "loaded freeze scheduler state");
        Ok(())
    }

    /// Default path for the scheduler state inside a run directory.
    pub fn state_path(run_dir: &Path) -> PathBuf {
        run_dir.join("freeze_scheduler_state.json")
    }
}

/// Reject stage ids that do not name a parameter group of `model`.
fn validate_stages(model: &dyn Model, stages: &[String]) -> ContinualResult<()> {
    let invalid: Vec<String> = stages
        .iter()
        .filter(|id| !model.has_group(id))
        .cloned()
        .collect();
    if invalid.is_empty() {
        return Ok(());
    }
    let available = model
        .parameter_groups()
        .into_iter()
        .take(MAX_LISTED_GROUPS)
        .collect::<Vec<_>>()
        .join(", ");
    Err(ContinualError::SchedulerValidation { invalid, available })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::store::CheckpointCompression;
    use crate::model::SequentialModel;

    fn model() -> SequentialModel {
        SequentialModel::new("head")
            .with_layer("model.0", 2, 2)
            .with_layer("model.1", 2, 2)
            .with_layer("model.2", 2, 2)
            .with_head(2, vec!["a".to_string(), "b".to_string()])
    }

    fn stages() -> Vec<String> {
        vec!["model.2".into(), "model.1".into(), "model.0".into()]
    }

    fn settings(min_epochs: usize) -> FreezeSettings {
        FreezeSettings {
            patience: 3,
            min_epochs_per_stage: min_epochs,
            plateau_tolerance: 0.005,
            auto_load_best: true,
        }
    }

    fn scheduler(model: &mut SequentialModel, dir: &Path, min_epochs: usize) -> FreezeScheduler {
        let store = StageWeightStore::new(dir.join("stage_weights"), CheckpointCompression::None);
        FreezeScheduler::new(model, stages(), settings(min_epochs), store).unwrap()
    }

    #[test]
    fn test_initial_freeze_trains_last_stage_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let s = scheduler(&mut m, dir.path(), 2);

        assert_eq!(s.current_stage(), Some(2));
        assert_eq!(s.current_stage_name(), Some("model.0"));
        assert!(m.requires_grad("model.0.weight"));
        assert!(!m.requires_grad("model.1.weight"));
        assert!(!m.requires_grad("head.weight"));
    }

    #[test]
    fn test_invalid_stage_lists_available_groups() {
        let mut m = model();
        let dir = tempfile::tempdir().unwrap();
        let store = StageWeightStore::new(dir.path(), CheckpointCompression::None);
        let err = FreezeScheduler::new(
            &mut m,
            vec!["model.1".into(), "backbone.7".into()],
            FreezeSettings::default(),
            store,
        )
        .unwrap_err();

        match err {
            ContinualError::SchedulerValidation { invalid, available } => {
                assert_eq!(invalid, vec!["backbone.7"]);
                assert!(available.contains("model.0"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stays_before_min_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 5);

        for _ in 0..4 {
            assert_eq!(s.step_epoch(1.0, None, &mut m).unwrap(), StageTransition::Stayed);
        }
        assert_eq!(s.current_stage(), Some(2));
        assert_eq!(
            s.step_epoch(1.0, None, &mut m).unwrap(),
            StageTransition::Advanced { from: 2, to: 1 }
        );
    }

    #[test]
    fn test_improving_metric_never_plateaus() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 1);

        let mut metric = 1.0;
        for _ in 0..10 {
            metric *= 0.9;
            assert_eq!(s.step_epoch(metric, None, &mut m).unwrap(), StageTransition::Stayed);
        }
    }

    #[test]
    fn test_full_walk_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 2);
        assert!(s.is_stage_changed());
        assert!(!s.is_stage_changed());

        // stage 2: 1.0, 1.0, 1.0 -> plateau once min epochs and patience are met
        s.step_epoch(1.0, None, &mut m).unwrap();
        s.step_epoch(1.0, None, &mut m).unwrap();
        assert_eq!(
            s.step_epoch(1.0, None, &mut m).unwrap(),
            StageTransition::Advanced { from: 2, to: 1 }
        );
        assert!(s.is_stage_changed());
        assert!(m.requires_grad("model.1.weight"));
        assert!(m.requires_grad("model.0.weight"));
        assert!(!m.requires_grad("model.2.weight"));

        s.step_epoch(1.0, None, &mut m).unwrap();
        assert_eq!(
            s.step_epoch(1.0, None, &mut m).unwrap(),
            StageTransition::Advanced { from: 1, to: 0 }
        );
        assert!(m.requires_grad("model.2.weight"));

        s.step_epoch(1.0, None, &mut m).unwrap();
        assert_eq!(s.step_epoch(1.0, None, &mut m).unwrap(), StageTransition::Completed);
        assert!(s.is_complete());
        assert_eq!(s.step_epoch(0.5, None, &mut m).unwrap(), StageTransition::Stayed);

        let status = s.status(&m);
        assert_eq!(status.remaining_stages, 0);
        assert_eq!(status.completed_stages, 3);
        assert_eq!(status.progress_percentage, 100.0);
        assert_eq!(status.recent_metrics.len(), 5);

        let found = s.store().discover().unwrap();
        let lasts = found.iter().filter(|a| a.kind == StageWeightKind::Last).count();
        assert_eq!(lasts, 3);
    }

    #[test]
    fn test_tolerance_band() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 1);

        // 0.996 >= 1.0 * 0.995, still flat
        s.step_epoch(1.0, None, &mut m).unwrap();
        s.step_epoch(0.996, None, &mut m).unwrap();
        assert!(matches!(
            s.step_epoch(0.999, None, &mut m).unwrap(),
            StageTransition::Advanced { .. }
        ));

        // a clear drop inside the window keeps the stage running
        s.step_epoch(1.0, None, &mut m).unwrap();
        s.step_epoch(0.9, None, &mut m).unwrap();
        assert_eq!(s.step_epoch(0.95, None, &mut m).unwrap(), StageTransition::Stayed);
    }

    #[test]
    fn test_auto_load_best_restores_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 1);

        m.parameters_mut().get_mut("model.0.weight").unwrap()[[0, 0]] = 3.0;
        s.step_epoch(0.5, None, &mut m).unwrap();
        m.parameters_mut().get_mut("model.0.weight").unwrap()[[0, 0]] = 9.0;
        s.step_epoch(0.6, None, &mut m).unwrap();
        let t = s.step_epoch(0.6, None, &mut m).unwrap();

        assert_eq!(t, StageTransition::Advanced { from: 2, to: 1 });
        assert_eq!(m.parameters()["model.0.weight"][[0, 0]], 3.0);
    }

    #[test]
    fn test_grad_norms_and_resume_info() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 10);

        s.record_grad_norm(0.3);
        s.record_grad_norm(0.2);
        s.step_epoch(1.0, None, &mut m).unwrap();

        assert_eq!(s.state().grad_norm_history[2], vec![0.3, 0.2]);
        let info = s.resume_info();
        assert!(info.can_resume);
        assert_eq!(info.completed_epochs, 1);
        assert_eq!(info.best_metrics[2], Some(1.0));
    }

    #[test]
    fn test_save_and_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut s = scheduler(&mut m, dir.path(), 1);
        for _ in 0..3 {
            s.step_epoch(1.0, None, &mut m).unwrap();
        }
        let path = FreezeScheduler::state_path(dir.path());
        s.save_state(&path).unwrap();

        let mut fresh_model = model();
        let mut restored = scheduler(&mut fresh_model, dir.path(), 1);
        restored.load_state(&path, &mut fresh_model).unwrap();

        assert_eq!(restored.state(), s.state());
        assert_eq!(restored.current_stage(), Some(1));
        assert!(fresh_model.requires_grad("model.1.weight"));
    }
}
