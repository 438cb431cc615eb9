//! Replay buffer of old training samples mixed into new-task batches.

use crate::config::TaskKind;
use crate::reconcile::descriptor::{
    classification_split_dir, label_dir_for, list_images, list_subdirs, DatasetDescriptor, Split,
};
use crate::reconcile::sample_indices;
use crate::{ContinualError, ContinualResult};
use scirs2_core::random::{Rng, StdRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An old training sample available for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplaySample {
    /// Image with its label file.
    Detection { image: PathBuf, label: PathBuf },
    /// Image inside a class folder.
    Classification { image: PathBuf, class_name: String },
}

impl ReplaySample {
    /// Image path.
    pub fn image(&self) -> &Path {
        match self {
            ReplaySample::Detection { image, .. } | ReplaySample::Classification { image, .. } => {
                image
            }
        }
    }

    /// Class folder name, for classification samples.
    pub fn class_name(&self) -> Option<&str> {
        match self {
            ReplaySample::Classification { class_name, .. } => Some(class_name.as_str()),
            ReplaySample::Detection { .. } => None,
        }
    }
}

/// Batch position that should be overwritten with a replay sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySlot {
    /// Index inside the batch.
    pub slot: usize,
    /// Index into the buffer.
    pub sample: usize,
}

/// Bounded set of old samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayBuffer {
    samples: Vec<ReplaySample>,
}

impl ReplayBuffer {
    /// Keep at most `max_samples`, chosen uniformly at random.
    pub fn from_samples(samples: Vec<ReplaySample>, max_samples: usize, rng: &mut StdRng) -> Self {
        if samples.len() <= max_samples {
            return Self { samples };
        }
        let keep = sample_indices(samples.len(), max_samples, rng);
        let mut slots: Vec<Option<ReplaySample>> = samples.into_iter().map(Some).collect();
        let samples = keep.into_iter().filter_map(|i| slots[i].take()).collect();
        Self { samples }
    }

    /// Collect the training split of the old dataset.
    ///
    /// Detection and segmentation keep images that have a label file.
    /// Classification keeps images of the `allowed` classes (all classes when
    /// `allowed` is `None`).
    pub fn build(
        old_source: &Path,
        kind: TaskKind,
        allowed: Option<&[String]>,
        max_samples: usize,
        rng: &mut StdRng,
    ) -> ContinualResult<Self> {
        let samples = if kind.uses_label_files() {
            Self::collect_labeled(old_source)?
        } else {
            Self::collect_class_folders(old_source, allowed)?
        };
        let found = samples.len();
        let buffer = Self::from_samples(samples, max_samples, rng);
        debug!(found, kept = buffer.len(), "built replay buffer");
        Ok(buffer)
    }

    fn collect_labeled(old_source: &Path) -> ContinualResult<Vec<ReplaySample>> {
        let descriptor = DatasetDescriptor::load(old_source)?;
        let image_dir = descriptor
            .split_dir(Split::Train)
            .filter(|d| d.is_dir())
            .ok_or_else(|| {
                ContinualError::DatasetError(format!(
                    "Old training images for {} cannot be located",
                    old_source.display()
                ))
            })?;
        let Some(label_dir) = label_dir_for(&image_dir).filter(|d| d.is_dir()) else {
            warn!(
                image_dir = %image_dir.display(),
                "old label directory not found; replay disabled"
            );
            return Ok(Vec::new());
        };

        let mut samples = Vec::new();
        for image in list_images(&image_dir)? {
            let Some(stem) = image.file_stem() else {
                continue;
            };
            let mut name = stem.to_os_string();
            name.push(".txt");
            let label = label_dir.join(name);
            if label.is_file() {
                samples.push(ReplaySample::Detection { image, label });
            }
        }
        Ok(samples)
    }

    fn collect_class_folders(
        old_source: &Path,
        allowed: Option<&[String]>,
    ) -> ContinualResult<Vec<ReplaySample>> {
        let train_dir = classification_split_dir(old_source, Split::Train)?.ok_or_else(|| {
            ContinualError::DatasetError(format!(
                "Old training class folders for {} cannot be located",
                old_source.display()
            ))
        })?;

        let mut samples = Vec::new();
        for class_dir in list_subdirs(&train_dir)? {
            let Some(class_name) = class_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if allowed.is_some_and(|names| !names.iter().any(|n| n == class_name)) {
                continue;
            }
            for image in list_images(&class_dir)? {
                samples.push(ReplaySample::Classification {
                    image,
                    class_name: class_name.to_string(),
                });
            }
        }
        Ok(samples)
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// All samples.
    pub fn samples(&self) -> &[ReplaySample] {
        &self.samples
    }

    /// Sample by index.
    pub fn get(&self, index: usize) -> Option<&ReplaySample> {
        self.samples.get(index)
    }

    /// Choose which batch positions to replace with replay samples.
    ///
    /// `floor(batch_size * ratio)` distinct positions are picked, each paired
    /// with a random buffer entry.
    pub fn plan_batch(&self, batch_size: usize, ratio: f64, rng: &mut StdRng) -> Vec<ReplaySlot> {
        if self.samples.is_empty() || batch_size == 0 || ratio <= 0.0 {
            return Vec::new();
        }
        let count = ((batch_size as f64 * ratio).floor() as usize).min(batch_size);
        sample_indices(batch_size, count, rng)
            .into_iter()
            .map(|slot| ReplaySlot {
                slot,
                sample: rng.gen_range(0..self.samples.len()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::random::SeedableRng;
    use std::collections::HashSet;
    use std::fs;

    fn fake(n: usize) -> Vec<ReplaySample> {
        (0..n)
            .map(|i| ReplaySample::Classification {
                image: PathBuf::from(format!("{}.jpg", i)),
                class_name: "cat".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_cap_applies() {
        let mut rng = StdRng::seed_from_u64(1);
        let buffer = ReplayBuffer::from_samples(fake(50), 10, &mut rng);
        assert_eq!(buffer.len(), 10);
        let unique: HashSet<_> = buffer.samples().iter().map(|s| s.image().to_path_buf()).collect();
        assert_eq!(unique.len(), 10);

        let small = ReplayBuffer::from_samples(fake(3), 10, &mut rng);
        assert_eq!(small.len(), 3);
    }

    #[test]
    fn test_plan_batch_distinct_slots() {
        let mut rng = StdRng::seed_from_u64(5);
        let buffer = ReplayBuffer::from_samples(fake(4), 100, &mut rng);

        let plan = buffer.plan_batch(8, 0.3, &mut rng);
        assert_eq!(plan.len(), 2);
        let slots: HashSet<usize> = plan.iter().map(|p| p.slot).collect();
        assert_eq!(slots.len(), 2);
        assert!(plan.iter().all(|p| p.slot < 8 && p.sample < 4));

        assert!(buffer.plan_batch(8, 0.0, &mut rng).is_empty());
        assert!(ReplayBuffer::default().plan_batch(8, 0.5, &mut rng).is_empty());
    }

    #[test]
    fn test_build_detection_keeps_labeled_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("images/train")).unwrap();
        fs::create_dir_all(dir.path().join("labels/train")).unwrap();
        for stem in ["a", "b", "c"] {
            fs::write(dir.path().join(format!("images/train/{}.jpg", stem)), b"x").unwrap();
        }
        fs::write(dir.path().join("labels/train/a.txt"), "0 0.5 0.5 0.1 0.1\n").unwrap();
        fs::write(dir.path().join("labels/train/c.txt"), "0 0.5 0.5 0.1 0.1\n").unwrap();
        let yaml = dir.path().join("data.yaml");
        fs::write(&yaml, "train: images/train\nnames: [cat]\n").unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let buffer = ReplayBuffer::build(&yaml, TaskKind::Detect, None, 100, &mut rng).unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(buffer
            .samples()
            .iter()
            .all(|s| matches!(s, ReplaySample::Detection { .. })));
    }

    #[test]
    fn test_build_detection_without_labels_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("images/train")).unwrap();
        fs::write(dir.path().join("images/train/a.jpg"), b"x").unwrap();
        let yaml = dir.path().join("data.yaml");
        fs::write(&yaml, "train: images/train\nnames: [cat]\n").unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let buffer = ReplayBuffer::build(&yaml, TaskKind::Detect, None, 100, &mut rng).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_build_classification_filters_classes() {
        let dir = tempfile::tempdir().unwrap();
        for (class, n) in [("cat", 3), ("dog", 2)] {
            let p = dir.path().join("train").join(class);
            fs::create_dir_all(&p).unwrap();
            for i in 0..n {
                fs::write(p.join(format!("{}.png", i)), b"x").unwrap();
            }
        }

        let mut rng = StdRng::seed_from_u64(0);
        let allowed = vec!["dog".to_string()];
        let buffer =
            ReplayBuffer::build(dir.path(), TaskKind::Classify, Some(&allowed), 100, &mut rng).unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(buffer
            .samples()
            .iter()
            .all(|s| s.class_name() == Some("dog")));
    }
}
