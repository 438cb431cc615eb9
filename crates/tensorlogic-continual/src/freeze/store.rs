//! On-disk stage artifacts of the freeze scheduler.
//!
//! Every stage writes up to two artifacts into the stage-weights directory:
//! `stage_{index}_best.json` whenever the stage's best metric improves and
//! `stage_{index}_last.json` when the stage is left. With compression enabled
//! the files are gzip streams named `*.json.gz`.

use crate::freeze::scheduler::SchedulerState;
use crate::model::ModelArtifact;
use crate::{ContinualError, ContinualResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Compression method for stage artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCompression {
    /// No compression (plain JSON).
    #[default]
    None,
    /// Gzip compression (good balance of speed and ratio).
    Gzip,
    /// Fast gzip compression (faster but lower ratio).
    GzipFast,
    /// Best gzip compression (slower but better ratio).
    GzipBest,
}

impl CheckpointCompression {
    fn level(&self) -> Option<Compression> {
        match self {
            CheckpointCompression::None => None,
            CheckpointCompression::Gzip => Some(Compression::default()),
            CheckpointCompression::GzipFast => Some(Compression::fast()),
            CheckpointCompression::GzipBest => Some(Compression::best()),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            CheckpointCompression::None => "json",
            _ => "json.gz",
        }
    }
}

/// Which of a stage's two artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageWeightKind {
    /// Weights at the stage's best metric.
    Best,
    /// Weights when the stage ended.
    Last,
}

impl StageWeightKind {
    /// File-name token.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageWeightKind::Best => "best",
            StageWeightKind::Last => "last",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "best" => Some(StageWeightKind::Best),
            "last" => Some(StageWeightKind::Last),
            _ => None,
        }
    }
}

impl fmt::Display for StageWeightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted weights of one stage plus the scheduler state at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageArtifact {
    /// Stage index.
    pub stage: usize,
    /// Best or last.
    pub kind: StageWeightKind,
    /// Total epochs completed when saved.
    pub epoch: usize,
    /// Metric of the epoch that produced the weights.
    pub metric: Option<f64>,
    /// Engine checkpoint the epoch reported, if any.
    pub source_checkpoint: Option<PathBuf>,
    /// Scheduler state snapshot.
    pub scheduler_state: SchedulerState,
    /// Model weights.
    pub model: ModelArtifact,
}

/// Artifact file found by [`StageWeightStore::discover`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoredStage {
    /// Stage index.
    pub stage: usize,
    /// Best or last.
    pub kind: StageWeightKind,
    /// File path.
    pub path: PathBuf,
}

/// Directory of stage artifacts.
#[derive(Debug, Clone)]
pub struct StageWeightStore {
    dir: PathBuf,
    compression: CheckpointCompression,
}

impl StageWeightStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>, compression: CheckpointCompression) -> Self {
        Self {
            dir: dir.into(),
            compression,
        }
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compression used for new artifacts.
    pub fn compression(&self) -> CheckpointCompression {
        self.compression
    }

    /// Path an artifact is written to.
    pub fn path_for(&self, stage: usize, kind: StageWeightKind) -> PathBuf {
        self.dir.join(format!(
            "stage_{}_{}.{}",
            stage,
            kind,
            self.compression.extension()
        ))
    }

    /// Write an artifact, returning its path.
    pub fn save(&self, artifact: &StageArtifact) -> ContinualResult<PathBuf> {
        let path = self.path_for(artifact.stage, artifact.kind);
        let json = serde_json::to_string(artifact).map_err(|e| {
            ContinualError::CheckpointError(format!("Failed to serialize stage artifact: {}", e))
        })?;

        fs::create_dir_all(&self.dir).map_err(|e| {
            ContinualError::CheckpointError(format!(
                "Failed to create stage weights directory: {}",
                e
            ))
        })?;

        match self.compression.level() {
            None => fs::write(&path, json).map_err(|e| {
                ContinualError::CheckpointError(format!("Failed to write stage artifact: {}", e))
            })?,
            Some(level) => {
                let file = File::create(&path).map_err(|e| {
                    ContinualError::CheckpointError(format!(
                        "Failed to create stage artifact file: {}",
                        e
                    ))
                })?;
                let mut encoder = GzEncoder::new(file, level);
                encoder.write_all(json.as_bytes()).map_err(|e| {
                    ContinualError::CheckpointError(format!(
                        "Failed to compress stage artifact: {}",
                        e
                    ))
                })?;
                encoder.finish().map_err(|e| {
                    ContinualError::CheckpointError(format!("Failed to finish compression: {}", e))
                })?;
            }
        }

        Ok(path)
    }

    /// Load the artifact of a stage, whichever encoding it was saved with.
    pub fn load(&self, stage: usize, kind: StageWeightKind) -> ContinualResult<Option<StageArtifact>> {
        for ext in ["json", "json.gz"] {
            let path = self.dir.join(format!("stage_{}_{}.{}", stage, kind, ext));
            if path.is_file() {
                return Self::load_path(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Load an artifact file; `.gz` files are decompressed.
    pub fn load_path(path: &Path) -> ContinualResult<StageArtifact> {
        let file = File::open(path).map_err(|e| {
            ContinualError::CheckpointError(format!(
                "Failed to open stage artifact {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut json = String::new();
        let read = if path.to_string_lossy().ends_with(".gz") {
            GzDecoder::new(file).read_to_string(&mut json)
        } else {
            let mut file = file;
            file.read_to_string(&mut json)
        };
        read.map_err(|e| {
            ContinualError::CheckpointError(format!(
                "Failed to read stage artifact {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&json).map_err(|e| {
            ContinualError::CheckpointError(format!(
                "Failed to deserialize stage artifact {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// List the stage artifacts present in the store, sorted by stage and kind.
    pub fn discover(&self) -> ContinualResult<Vec<StoredStage>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((stage, kind)) = parse_artifact_name(name) {
                found.push(StoredStage { stage, kind, path });
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Parse `stage_{index}_{best|last}.json[.gz]`.
fn parse_artifact_name(name: &str) -> Option<(usize, StageWeightKind)> {
    let stem = name
        .strip_suffix(".json.gz")
        .or_else(|| name.strip_suffix(".json"))?;
    let rest = stem.strip_prefix("stage_")?;
    let (index, kind) = rest.rsplit_once('_')?;
    Some((index.parse().ok()?, StageWeightKind::parse(kind)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequentialModel;

    fn artifact(stage: usize, kind: StageWeightKind) -> StageArtifact {
        let model = SequentialModel::new("head")
            .with_layer("model.0", 2, 2)
            .with_head(2, vec!["a".to_string()]);
        StageArtifact {
            stage,
            kind,
            epoch: 4,
            metric: Some(0.5),
            source_checkpoint: None,
            scheduler_state: SchedulerState::new(vec!["model.0".to_string()]),
            model: ModelArtifact::from_model(&model),
        }
    }

    #[test]
    fn test_parse_artifact_name() {
        assert_eq!(
            parse_artifact_name("stage_3_best.json"),
            Some((3, StageWeightKind::Best))
        );
        assert_eq!(
            parse_artifact_name("stage_12_last.json.gz"),
            Some((12, StageWeightKind::Last))
        );
        assert_eq!(parse_artifact_name("stage_x_best.json"), None);
        assert_eq!(parse_artifact_name("stage_1_final.json"), None);
        assert_eq!(parse_artifact_name("notes.txt"), None);
    }

    #[test]
    fn test_save_load_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        for compression in [CheckpointCompression::None, CheckpointCompression::Gzip] {
            let store = StageWeightStore::new(dir.path().join(format!("{:?}", compression)), compression);
            let saved = artifact(2, StageWeightKind::Best);
            let path = store.save(&saved).unwrap();
            assert_eq!(
                path.to_string_lossy().ends_with(".gz"),
                compression != CheckpointCompression::None
            );

            let loaded = store.load(2, StageWeightKind::Best).unwrap().unwrap();
            assert_eq!(loaded, saved);
            assert!(store.load(2, StageWeightKind::Last).unwrap().is_none());
        }
    }

    #[test]
    fn test_discover_lists_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = StageWeightStore::new(dir.path(), CheckpointCompression::GzipFast);
        store.save(&artifact(1, StageWeightKind::Last)).unwrap();
        store.save(&artifact(1, StageWeightKind::Best)).unwrap();
        store.save(&artifact(0, StageWeightKind::Best)).unwrap();
        fs::write(dir.path().join("readme.md"), "x").unwrap();

        let found: Vec<(usize, StageWeightKind)> = store
            .discover()
            .unwrap()
            .into_iter()
            .map(|s| (s.stage, s.kind))
            .collect();
        assert_eq!(
            found,
            vec![
                (0, StageWeightKind::Best),
                (1, StageWeightKind::Best),
                (1, StageWeightKind::Last)
            ]
        );

        let empty = StageWeightStore::new(dir.path().join("missing"), CheckpointCompression::None);
        assert!(empty.discover().unwrap().is_empty());
    }
}
