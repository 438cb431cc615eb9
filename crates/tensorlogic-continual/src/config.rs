//! Typed configuration for training tasks and the orchestrator.
//!
//! Training requests arrive as [`TrainingConfig`] values; every field has a
//! default so partially specified TOML or JSON documents deserialize cleanly.
//! Process-wide settings live in [`OrchestratorConfig`], which is loaded from:
//! - the path in the `TENSORLOGIC_CONTINUAL_CONFIG` environment variable
//! - `.continualrc` in the current directory
//! - built-in defaults

use crate::{ContinualError, ContinualResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an orchestrator configuration file.
pub const CONFIG_ENV_VAR: &str = "TENSORLOGIC_CONTINUAL_CONFIG";

/// Vision task family a model is trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Object detection.
    #[default]
    Detect,
    /// Instance segmentation.
    Segment,
    /// Image classification.
    Classify,
}

impl TaskKind {
    /// Wire name of the task kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Detect => "detect",
            TaskKind::Segment => "segment",
            TaskKind::Classify => "classify",
        }
    }

    /// Whether labels live in a parallel label directory (detect/segment).
    pub fn uses_label_files(&self) -> bool {
        !matches!(self, TaskKind::Classify)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    /// Nano.
    N,
    /// Small.
    #[default]
    S,
    /// Medium.
    M,
    /// Large.
    L,
    /// Extra large.
    X,
}

impl ModelSize {
    /// Single-letter size code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::N => "n",
            ModelSize::S => "s",
            ModelSize::M => "m",
            ModelSize::L => "l",
            ModelSize::X => "x",
        }
    }
}

/// Kind of training run a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingType {
    /// Plain training without staged freezing.
    Regular,
    /// Old + new dataset training with label-space reconciliation.
    Incremental,
    /// Training with the freeze-stage scheduler.
    FreezeStrategy,
    /// Teacher/student knowledge distillation.
    Distillation,
}

impl TrainingType {
    /// Wire name of the training type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingType::Regular => "regular",
            TrainingType::Incremental => "incremental",
            TrainingType::FreezeStrategy => "freeze_strategy",
            TrainingType::Distillation => "distillation",
        }
    }
}

impl fmt::Display for TrainingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distillation term weights and teacher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillationSettings {
    /// Frozen teacher checkpoint.
    pub teacher_model_path: Option<PathBuf>,
    /// Softening temperature for the classification KL term.
    pub temperature: f64,
    /// Weight of the classification distillation term.
    pub cls_weight: f64,
    /// Weight of the box regression distillation term.
    pub reg_weight: f64,
    /// Weight of the feature distillation term.
    pub feat_weight: f64,
    /// Weight of the mask prototype distillation term.
    pub mask_weight: f64,
    /// Down-weighting factor for background rows.
    pub bg_weight: f64,
    /// Per-class foreground weights keyed by combined class id.
    pub class_weights: BTreeMap<usize, f64>,
    /// Teacher confidence above which a row counts as foreground.
    pub teacher_conf_threshold: f64,
    /// Confidence threshold for teacher pseudo-labels; outside (0, 1) disables them.
    pub pseudo_conf_threshold: f64,
    /// IoU threshold for pseudo-label suppression.
    pub pseudo_iou_threshold: f64,
    /// Evaluate teacher on weak and student on strong views.
    pub enable_consistency: bool,
    /// Scale applied to the composed distillation loss in consistency mode.
    pub consistency_weight: f64,
}

impl Default for DistillationSettings {
    fn default() -> Self {
        Self {
            teacher_model_path: None,
            temperature: 2.0,
            cls_weight: 1.0,
            reg_weight: 2.0,
            feat_weight: 5.0,
            mask_weight: 1.0,
            bg_weight: 0.05,
            class_weights: BTreeMap::new(),
            teacher_conf_threshold: 0.25,
            pseudo_conf_threshold: 0.7,
            pseudo_iou_threshold: 0.7,
            enable_consistency: false,
            consistency_weight: 1.0,
        }
    }
}

impl DistillationSettings {
    /// Whether teacher pseudo-labeling is active.
    pub fn pseudo_labels_enabled(&self) -> bool {
        self.pseudo_conf_threshold > 0.0 && self.pseudo_conf_threshold < 1.0
    }
}

/// Old-sample replay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Fraction of each batch (or of the old dataset, for incremental runs).
    pub ratio: f64,
    /// Multiplier for distillation terms computed on replayed samples.
    pub distill_boost: f64,
    /// Upper bound on the replay buffer size.
    pub max_samples: usize,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            ratio: 0.0,
            distill_boost: 1.0,
            max_samples: 1000,
        }
    }
}

/// Old-dataset fraction used by incremental runs when no replay ratio is given.
pub const DEFAULT_INCREMENTAL_OLD_RATIO: f64 = 0.2;

/// Configuration of a single training task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Task family.
    pub task: TaskKind,
    /// Model size class.
    pub model_size: ModelSize,
    /// New (current) dataset descriptor or root.
    pub data_path: PathBuf,
    /// Epoch budget.
    pub epochs: usize,
    /// Batch size.
    pub batch: usize,
    /// Square input image size.
    pub image_size: usize,
    /// Output root; runs land in `{output_dir}/{name}`.
    pub output_dir: PathBuf,
    /// Run name (derived from the task id when absent).
    pub name: Option<String>,
    /// Checkpoint to resume from.
    pub resume_weights: Option<PathBuf>,
    /// Early-stopping patience for regular training.
    pub patience: usize,
    /// Install the freeze-stage scheduler for freeze-strategy runs.
    pub use_freeze_strategy: bool,
    /// Minimum epochs spent in each freeze stage.
    pub min_epochs_per_stage: usize,
    /// Plateau window length for the freeze scheduler.
    pub freeze_patience: usize,
    /// Relative tolerance of the plateau test.
    pub plateau_tolerance: f64,
    /// Explicit stage identifiers; the size-based default plan is used when empty.
    pub freeze_stages: Vec<String>,
    /// Base checkpoint for incremental runs, student start point for distillation.
    pub base_model_path: Option<PathBuf>,
    /// Classes the operator expects to be new.
    pub new_classes: Option<Vec<String>>,
    /// Old dataset descriptor or root.
    pub old_data_path: Option<PathBuf>,
    /// Distillation settings.
    pub distillation: DistillationSettings,
    /// Replay settings.
    pub replay: ReplaySettings,
    /// Seed for sampling, head initialization and augmentation.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            task: TaskKind::Detect,
            model_size: ModelSize::S,
            data_path: PathBuf::from("data.yaml"),
            epochs: 50,
            batch: 8,
            image_size: 640,
            output_dir: PathBuf::from("runs/train"),
            name: None,
            resume_weights: None,
            patience: 15,
            use_freeze_strategy: true,
            min_epochs_per_stage: 15,
            freeze_patience: 3,
            plateau_tolerance: 0.005,
            freeze_stages: Vec::new(),
            base_model_path: None,
            new_classes: None,
            old_data_path: None,
            distillation: DistillationSettings::default(),
            replay: ReplaySettings::default(),
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Validate numeric ranges and the paths required by `training_type`.
    pub fn validate(&self, training_type: TrainingType) -> ContinualResult<()> {
        if self.epochs == 0 {
            return Err(ContinualError::ConfigError(
                "epochs must be positive".to_string(),
            ));
        }
        if self.batch == 0 {
            return Err(ContinualError::ConfigError(
                "batch must be positive".to_string(),
            ));
        }
        if self.image_size == 0 {
            return Err(ContinualError::ConfigError(
                "image_size must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.replay.ratio) {
            return Err(ContinualError::ConfigError(format!(
                "replay ratio must be in [0, 1], got {}",
                self.replay.ratio
            )));
        }
        if self.replay.distill_boost < 0.0 {
            return Err(ContinualError::ConfigError(
                "replay distill_boost must be non-negative".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.plateau_tolerance) {
            return Err(ContinualError::ConfigError(format!(
                "plateau_tolerance must be in [0, 1), got {}",
                self.plateau_tolerance
            )));
        }

        let d = &self.distillation;
        if d.temperature <= 0.0 {
            return Err(ContinualError::ConfigError(
                "Temperature must be positive".to_string(),
            ));
        }
        for (name, weight) in [
            ("cls_weight", d.cls_weight),
            ("reg_weight", d.reg_weight),
            ("feat_weight", d.feat_weight),
            ("mask_weight", d.mask_weight),
            ("bg_weight", d.bg_weight),
            ("consistency_weight", d.consistency_weight),
        ] {
            if weight < 0.0 || !weight.is_finite() {
                return Err(ContinualError::ConfigError(format!(
                    "{} must be a finite non-negative value, got {}",
                    name, weight
                )));
            }
        }

        match training_type {
            TrainingType::Regular => {}
            TrainingType::FreezeStrategy => {
                if self.use_freeze_strategy && self.freeze_patience == 0 {
                    return Err(ContinualError::ConfigError(
                        "freeze_patience must be positive".to_string(),
                    ));
                }
            }
            TrainingType::Incremental => {
                if self.old_data_path.is_none() {
                    return Err(ContinualError::ConfigError(
                        "incremental training requires old_data_path".to_string(),
                    ));
                }
                if self.base_model_path.is_none() {
                    return Err(ContinualError::ConfigError(
                        "incremental training requires base_model_path".to_string(),
                    ));
                }
            }
            TrainingType::Distillation => {
                if d.teacher_model_path.is_none() {
                    return Err(ContinualError::ConfigError(
                        "distillation training requires distillation.teacher_model_path"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Fraction of old training samples mixed into an incremental run.
    pub fn incremental_old_ratio(&self) -> f64 {
        if self.replay.ratio > 0.0 {
            self.replay.ratio
        } else {
            DEFAULT_INCREMENTAL_OLD_RATIO
        }
    }

    /// Load a training config from a TOML file.
    pub fn load(path: &Path) -> ContinualResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ContinualError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            ContinualError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// How dataset views are materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeMode {
    /// Symlink each file, copying when symlinks are unavailable.
    #[default]
    SymlinkOrCopy,
    /// Always copy files.
    Copy,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default level filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Process-wide orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Scratch directory for reconciled dataset views.
    pub work_dir: PathBuf,
    /// Directory name (under the run directory) holding stage artifacts.
    pub stage_weights_dir: String,
    /// Dataset materialization strategy.
    pub materialize: MaterializeMode,
    /// Gzip stage artifacts.
    pub compress_stage_weights: bool,
    /// Reload the previous stage's best weights on stage entry.
    pub auto_load_best: bool,
    /// Seed used when a task does not specify one.
    pub default_seed: Option<u64>,
    /// Logging settings.
    pub log: LogSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("tensorlogic-continual"),
            stage_weights_dir: "stage_weights".to_string(),
            materialize: MaterializeMode::SymlinkOrCopy,
            compress_stage_weights: false,
            auto_load_best: true,
            default_seed: None,
            log: LogSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ContinualResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ContinualError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            ContinualError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ContinualResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ContinualError::Serialization(format!("Failed to serialize configuration: {}", e))
        })?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Find and load configuration, falling back to defaults.
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            match Self::load(Path::new(&path)) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring unreadable config"),
            }
        }

        let current = PathBuf::from(".continualrc");
        if current.exists() {
            if let Ok(config) = Self::load(&current) {
                return config;
            }
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_training_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 50);
        assert_eq!(config.batch, 8);
        assert_eq!(config.image_size, 640);
        assert_eq!(config.min_epochs_per_stage, 15);
        assert_eq!(config.distillation.temperature, 2.0);
        assert_eq!(config.distillation.bg_weight, 0.05);
        assert_eq!(config.replay.max_samples, 1000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TrainingConfig = toml::from_str(
            r#"
            task = "classify"
            model_size = "m"
            epochs = 3

            [distillation]
            teacher_model_path = "teacher.json"
            cls_weight = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.task, TaskKind::Classify);
        assert_eq!(config.model_size, ModelSize::M);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch, 8);
        assert_eq!(config.distillation.cls_weight, 0.5);
        assert_eq!(config.distillation.reg_weight, 2.0);
        config.validate(TrainingType::Distillation).unwrap();
    }

    #[test]
    fn test_validate_type_specific_paths() {
        let config = TrainingConfig::default();
        assert!(config.validate(TrainingType::Regular).is_ok());

        let err = config.validate(TrainingType::Incremental).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("old_data_path"));

        let err = config.validate(TrainingType::Distillation).unwrap_err();
        assert!(err.to_string().contains("teacher_model_path"));

        let incremental = TrainingConfig {
            old_data_path: Some("old.yaml".into()),
            base_model_path: Some("base.json".into()),
            ..Default::default()
        };
        assert!(incremental.validate(TrainingType::Incremental).is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let mut config = TrainingConfig::default();
        config.distillation.feat_weight = -1.0;
        assert!(config.validate(TrainingType::Regular).is_err());
    }

    #[test]
    fn test_incremental_ratio_fallback() {
        let mut config = TrainingConfig::default();
        assert_eq!(config.incremental_old_ratio(), DEFAULT_INCREMENTAL_OLD_RATIO);
        config.replay.ratio = 0.4;
        assert_eq!(config.incremental_old_ratio(), 0.4);
    }

    #[test]
    fn test_orchestrator_config_roundtrip() {
        let config = OrchestratorConfig {
            compress_stage_weights: true,
            default_seed: Some(7),
            ..Default::default()
        };
        let toml_str = toml::to_string(&config).unwrap();
        let restored: OrchestratorConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_training_type_wire_names() {
        assert_eq!(TrainingType::FreezeStrategy.as_str(), "freeze_strategy");
        let json = serde_json::to_string(&TrainingType::Distillation).unwrap();
        assert_eq!(json, "\"distillation\"");
    }
}
