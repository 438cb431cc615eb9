//! Per-type training strategies run on a task's worker thread.
//!
//! Every strategy prepares a model, a dataset view and a loss hook, then
//! hands them to the shared [`Trainer`] loop. They differ only in what they
//! prepare:
//!
//! | type            | model source                | dataset          | extras                      |
//! |-----------------|-----------------------------|------------------|-----------------------------|
//! | regular         | resume checkpoint or stock  | as given         | early stopping              |
//! | freeze_strategy | resume checkpoint or stock  | as given         | freeze scheduler            |
//! | incremental     | base checkpoint             | old + new mixed  | adapted head                |
//! | distillation    | base or teacher checkpoint  | new, remapped    | teacher, replay, objective  |

use crate::callbacks::{CallbackList, EarlyStoppingCallback, EpochCallback, ProgressCallback};
use crate::config::{OrchestratorConfig, TrainingConfig, TrainingType};
use crate::engine::{Hyperparameters, ModelSource, TrainingEngine};
use crate::freeze::{
    resolve_stage_plan, CheckpointCompression, FreezeCallback, FreezeScheduler, FreezeSettings,
    StageWeightStore,
};
use crate::model::{Model, ModelArtifact};
use crate::objective::{DistillationObjective, GroundTruthObjective, Objective, TeacherAlignment};
use crate::orchestrator::task::{TrainingOutcome, TrainingTask};
use crate::reconcile::{
    adapt_model, build_mixed_dataset, materializer_for, DatasetView, HeadAdaptation,
    LabelSpaceMapping, MixOptions, ReplayBuffer, Taxonomy,
};
use crate::trainer::{Trainer, TrainingInputs, TrainingState};
use crate::{ContinualError, ContinualResult};
use parking_lot::{Mutex, RwLock};
use scirs2_core::random::{SeedableRng, StdRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// File name of the model artifact written at the end of every run.
pub const FINAL_ARTIFACT: &str = "final.json";

/// Everything a worker thread needs.
pub struct WorkerContext {
    /// Task id.
    pub task_id: String,
    /// Strategy selector.
    pub training_type: TrainingType,
    /// Snapshot of the task's config.
    pub config: TrainingConfig,
    /// Training engine.
    pub engine: Arc<dyn TrainingEngine>,
    /// Orchestrator settings.
    pub settings: Arc<OrchestratorConfig>,
    /// Task record updated with progress and log lines.
    pub record: Arc<RwLock<TrainingTask>>,
    /// Cooperative cancellation flag.
    pub cancel: Arc<AtomicBool>,
}

impl WorkerContext {
    fn log(&self, message: impl AsRef<str>) {
        self.record.write().log(message);
    }

    /// Directory holding this run's outputs.
    pub fn run_dir(&self) -> PathBuf {
        let name = self.config.name.as_deref().unwrap_or(&self.task_id);
        self.config.output_dir.join(name)
    }
}

/// What a strategy hands to the training loop.
struct PreparedRun {
    model: Box<dyn Model>,
    dataset: DatasetView,
    teacher: Option<Box<dyn Model>>,
    objective: Box<dyn Objective>,
    replay: Option<ReplayBuffer>,
    scheduler: Option<Arc<Mutex<FreezeScheduler>>>,
    early_stopping: bool,
}

impl PreparedRun {
    fn plain(model: Box<dyn Model>, dataset: DatasetView) -> Self {
        Self {
            model,
            dataset,
            teacher: None,
            objective: Box::new(GroundTruthObjective),
            replay: None,
            scheduler: None,
            early_stopping: true,
        }
    }
}

/// Seed of a run: the task's, else the orchestrator default, else the clock.
pub fn resolve_seed(config: &TrainingConfig, settings: &OrchestratorConfig) -> u64 {
    config.seed.or(settings.default_seed).unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64)
    })
}

/// Where a regular or freeze run takes its starting weights from.
pub fn initial_source(config: &TrainingConfig) -> ModelSource {
    match &config.resume_weights {
        Some(path) => ModelSource::Checkpoint(path.clone()),
        None => ModelSource::Pretrained {
            task: config.task,
            size: config.model_size,
        },
    }
}

/// Validate, prepare and train; returns the result path and summary metrics.
pub fn run_task(ctx: &WorkerContext) -> ContinualResult<TrainingOutcome> {
    let config = &ctx.config;
    ctx.log(format!("Validating {} configuration", ctx.training_type));
    config.validate(ctx.training_type)?;

    let run_dir = ctx.run_dir();
    fs::create_dir_all(&run_dir)?;
    let seed = resolve_seed(config, &ctx.settings);
    let mut rng = StdRng::seed_from_u64(seed);
    ctx.log(format!("Run directory: {} (seed {})", run_dir.display(), seed));

    let mut prepared = match ctx.training_type {
        TrainingType::Regular => prepare_regular(ctx)?,
        TrainingType::FreezeStrategy => prepare_freeze(ctx, &run_dir)?,
        TrainingType::Incremental => prepare_incremental(ctx, &mut rng)?,
        TrainingType::Distillation => prepare_distillation(ctx, &mut rng)?,
    };

    let hyper = Hyperparameters {
        seed: Some(seed),
        ..Hyperparameters::from_config(config)
    };
    let mut trainer = Trainer::new(ctx.engine.as_ref(), hyper)
        .with_callbacks(build_callbacks(ctx, &prepared))
        .with_cancel_flag(Arc::clone(&ctx.cancel));

    ctx.log(format!(
        "Training {} epochs with objective '{}'",
        config.epochs,
        prepared.objective.name()
    ));
    let history = trainer.train(
        prepared.model.as_mut(),
        &TrainingInputs {
            dataset: &prepared.dataset,
            teacher: prepared.teacher.as_deref(),
            objective: prepared.objective.as_ref(),
            replay: prepared.replay.as_ref(),
            run_dir: &run_dir,
        },
    )?;
    if history.cancelled {
        ctx.log(format!(
            "Cancellation observed after {} epochs",
            history.epochs_run()
        ));
    }

    let final_path = run_dir.join("weights").join(FINAL_ARTIFACT);
    ModelArtifact::from_model(prepared.model.as_ref()).save(&final_path)?;

    let mut metrics = history
        .last()
        .map(|report| report.metrics.clone())
        .unwrap_or_default();
    if let Some((_, best)) = history.best_val_metric() {
        metrics.insert("best_metric".to_string(), best);
    }
    metrics.insert("epochs_run".to_string(), history.epochs_run() as f64);

    if let Some(scheduler) = &prepared.scheduler {
        let scheduler = scheduler.lock();
        metrics.extend(scheduler.status(prepared.model.as_ref()).to_metrics());
        scheduler.save_state(&FreezeScheduler::state_path(&run_dir))?;
    }

    let result_path = history
        .best_checkpoint()
        .map(Path::to_path_buf)
        .unwrap_or(final_path);
    Ok(TrainingOutcome {
        result_path,
        metrics,
    })
}

fn build_callbacks(ctx: &WorkerContext, prepared: &PreparedRun) -> CallbackList {
    let mut callbacks = CallbackList::new();
    callbacks.add(Box::new(EpochCallback::new(ctx.task_id.clone())));

    if let Some(scheduler) = &prepared.scheduler {
        callbacks.add(Box::new(FreezeCallback::new(Arc::clone(scheduler))));
    } else if prepared.early_stopping && ctx.config.patience > 0 {
        callbacks.add(Box::new(EarlyStoppingCallback::new(ctx.config.patience, 0.0)));
    }

    let record = Arc::clone(&ctx.record);
    callbacks.add(Box::new(ProgressCallback::new(move |state: &TrainingState| {
        let mut task = record.write();
        let epoch = state.epoch + 1;
        if task.update_progress(epoch, state.total_epochs) {
            task.log(format!(
                "Epoch {}/{}: metric={:.5}",
                epoch,
                state.total_epochs,
                state.val_metric.unwrap_or(f64::NAN)
            ));
        }
    })));
    callbacks
}

fn prepare_regular(ctx: &WorkerContext) -> ContinualResult<PreparedRun> {
    let config = &ctx.config;
    let source = initial_source(config);
    ctx.log(format!("Loading model from {:?}", source));
    let model = ctx.engine.load_model(&source)?;
    let dataset = DatasetView::passthrough(
        config.data_path.clone(),
        config.task,
        model.class_names().to_vec(),
    );
    Ok(PreparedRun::plain(model, dataset))
}

fn prepare_freeze(ctx: &WorkerContext, run_dir: &Path) -> ContinualResult<PreparedRun> {
    let mut prepared = prepare_regular(ctx)?;
    let config = &ctx.config;
    if !config.use_freeze_strategy {
        ctx.log("Freeze strategy disabled, training all parameters");
        return Ok(prepared);
    }

    let stages = resolve_stage_plan(&config.freeze_stages, config.model_size);
    let compression = if ctx.settings.compress_stage_weights {
        CheckpointCompression::Gzip
    } else {
        CheckpointCompression::None
    };
    let store = StageWeightStore::new(
        run_dir.join(&ctx.settings.stage_weights_dir),
        compression,
    );
    let settings = FreezeSettings {
        patience: config.freeze_patience,
        min_epochs_per_stage: config.min_epochs_per_stage,
        plateau_tolerance: config.plateau_tolerance,
        auto_load_best: ctx.settings.auto_load_best,
    };
    let mut scheduler =
        FreezeScheduler::new(prepared.model.as_mut(), stages.clone(), settings, store)?;

    let state_path = FreezeScheduler::state_path(run_dir);
    if config.resume_weights.is_some() && state_path.exists() {
        scheduler.load_state(&state_path, prepared.model.as_mut())?;
        let info = scheduler.resume_info();
        ctx.log(format!(
            "Resumed freeze schedule at stage {:?} after {} epochs",
            info.current_stage, info.completed_epochs
        ));
    }

    ctx.log(format!(
        "Freeze strategy: {} stages {:?}, starting with {}",
        stages.len(),
        stages,
        scheduler.current_stage_name().unwrap_or("none")
    ));
    prepared.scheduler = Some(Arc::new(Mutex::new(scheduler)));
    prepared.early_stopping = false;
    Ok(prepared)
}

fn required_path<'a>(path: Option<&'a PathBuf>, what: &str) -> ContinualResult<&'a Path> {
    path.map(PathBuf::as_path)
        .ok_or_else(|| ContinualError::ConfigError(format!("missing {}", what)))
}

fn log_mapping(ctx: &WorkerContext, mapping: &LabelSpaceMapping) {
    ctx.log(format!(
        "Label space: {} old + {} new = {} classes, added {:?}",
        mapping.old_names.len(),
        mapping.new_names.len(),
        mapping.num_classes(),
        mapping.added_names()
    ));
    if let Some(declared) = &ctx.config.new_classes {
        let (unexpected, undeclared) = mapping.compare_declared(declared);
        if !unexpected.is_empty() || !undeclared.is_empty() {
            ctx.log(format!(
                "Warning: declared new classes differ from the data (not new: {:?}, undeclared: {:?})",
                unexpected, undeclared
            ));
        }
    }
}

fn log_adaptation(ctx: &WorkerContext, adaptation: &HeadAdaptation) {
    if adaptation.replaced {
        ctx.log(format!(
            "Head resized {} -> {} classes ({} copied, {} initialized)",
            adaptation.previous_classes,
            adaptation.combined_classes,
            adaptation.copied.len(),
            adaptation.initialized.len()
        ));
    } else {
        ctx.log(format!(
            "Head kept at {} classes",
            adaptation.combined_classes
        ));
    }
}

fn prepare_incremental(ctx: &WorkerContext, rng: &mut StdRng) -> ContinualResult<PreparedRun> {
    let config = &ctx.config;
    let old_source = required_path(config.old_data_path.as_ref(), "old_data_path")?;
    let base = required_path(config.base_model_path.as_ref(), "base_model_path")?;

    let old = Taxonomy::load(old_source, config.task)?;
    let new = Taxonomy::load(&config.data_path, config.task)?;
    let mapping = LabelSpaceMapping::analyze(&old, &new);
    log_mapping(ctx, &mapping);

    ctx.log(format!("Loading base model {}", base.display()));
    let mut model = ctx
        .engine
        .load_model(&ModelSource::Checkpoint(base.to_path_buf()))?;
    mapping.check_model_classes(model.class_names())?;

    let work_dir = ctx.settings.work_dir.join(&ctx.task_id);
    let materializer = materializer_for(ctx.settings.materialize);
    let ratio = config.incremental_old_ratio();
    let dataset = build_mixed_dataset(
        Some(old_source),
        &config.data_path,
        &mapping,
        config.task,
        ratio,
        &MixOptions {
            work_dir: &work_dir,
            materializer: materializer.as_ref(),
        },
        rng,
    )?;
    ctx.log(format!(
        "Mixed dataset at {} (old fraction {:.2}, {} files skipped)",
        dataset.descriptor.display(),
        ratio,
        dataset.skipped.len()
    ));

    let adaptation = adapt_model(model.as_mut(), &mapping, config.task, rng)?;
    log_adaptation(ctx, &adaptation);
    Ok(PreparedRun::plain(model, dataset))
}

fn prepare_distillation(ctx: &WorkerContext, rng: &mut StdRng) -> ContinualResult<PreparedRun> {
    let config = &ctx.config;
    let teacher_path = required_path(
        config.distillation.teacher_model_path.as_ref(),
        "distillation.teacher_model_path",
    )?;

    ctx.log(format!("Loading teacher {}", teacher_path.display()));
    let mut teacher = ctx
        .engine
        .load_model(&ModelSource::Checkpoint(teacher_path.to_path_buf()))?;
    teacher.freeze_all();

    let student_path = config.base_model_path.as_deref().unwrap_or(teacher_path);
    ctx.log(format!("Loading student {}", student_path.display()));
    let mut student = ctx
        .engine
        .load_model(&ModelSource::Checkpoint(student_path.to_path_buf()))?;

    let old = match &config.old_data_path {
        Some(old_source) => Taxonomy::load(old_source, config.task)?,
        None => Taxonomy::new(teacher.class_names().to_vec())?,
    };
    let new = Taxonomy::load(&config.data_path, config.task)?;
    let mapping = LabelSpaceMapping::analyze(&old, &new);
    log_mapping(ctx, &mapping);
    mapping.check_model_classes(student.class_names())?;

    let work_dir = ctx.settings.work_dir.join(&ctx.task_id);
    let materializer = materializer_for(ctx.settings.materialize);
    let dataset = build_mixed_dataset(
        None,
        &config.data_path,
        &mapping,
        config.task,
        0.0,
        &MixOptions {
            work_dir: &work_dir,
            materializer: materializer.as_ref(),
        },
        rng,
    )?;

    let adaptation = adapt_model(student.as_mut(), &mapping, config.task, rng)?;
    log_adaptation(ctx, &adaptation);

    let replay = match &config.old_data_path {
        Some(old_source) if config.replay.max_samples > 0 => {
            let buffer = ReplayBuffer::build(
                old_source,
                config.task,
                Some(old.names()),
                config.replay.max_samples,
                rng,
            )?;
            ctx.log(format!(
                "Replay buffer: {} samples, ratio {:.2}",
                buffer.len(),
                config.replay.ratio
            ));
            Some(buffer)
        }
        _ => None,
    };

    let alignment = TeacherAlignment::by_name(teacher.class_names(), student.class_names());
    let objective = DistillationObjective::new(
        &config.distillation,
        &config.replay,
        config.task,
        alignment,
        mapping.new_class_ids.iter().copied(),
    )?;
    ctx.log(format!(
        "Distillation terms {:?}, temperature {}",
        objective.terms(),
        config.distillation.temperature
    ));

    Ok(PreparedRun {
        model: student,
        dataset,
        teacher: Some(teacher),
        objective: Box::new(objective),
        replay,
        scheduler: None,
        early_stopping: true,
    })
}
