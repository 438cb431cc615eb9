//! Building the reconciled dataset a run trains on.
//!
//! For detection and segmentation the new dataset is mirrored with every
//! label rewritten into the combined class space, while old files are
//! referenced as they are. For classification the class folders of both
//! datasets are merged, with each file name prefixed by its provenance.

use crate::config::TaskKind;
use crate::reconcile::descriptor::{
    classification_split_dir, label_dir_for, list_images, list_subdirs, ClassNames,
    DatasetDescriptor, Split,
};
use crate::reconcile::mapping::LabelSpaceMapping;
use crate::reconcile::materialize::Materializer;
use crate::reconcile::sample_indices;
use crate::{ContinualError, ContinualResult};
use scirs2_core::random::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name of the generated descriptor for detection and segmentation.
pub const MIXED_DESCRIPTOR: &str = "mixed_data.yaml";
/// Directory of the remapped new-dataset mirror.
pub const NEW_MIRROR_DIR: &str = "new_data_mirror";
/// Directory of the merged classification tree.
pub const MERGED_CLASSIFY_DIR: &str = "mixed_cls_data";

/// Which dataset a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Previously trained dataset.
    Old,
    /// Newly supplied dataset.
    New,
}

impl Provenance {
    fn file_prefix(&self) -> &'static str {
        match self {
            Provenance::Old => "old_",
            Provenance::New => "new_",
        }
    }
}

/// One logical sample of the view and where its files physically live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRef {
    /// Image path the engine should read.
    pub image: PathBuf,
    /// Label path (detection and segmentation).
    pub label: Option<PathBuf>,
    /// Class folder name (classification).
    pub class_name: Option<String>,
    /// Source dataset.
    pub provenance: Provenance,
}

/// Reconciled dataset handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetView {
    /// Task kind.
    pub kind: TaskKind,
    /// Descriptor YAML or classification root the engine should load.
    pub descriptor: PathBuf,
    /// Class names of the combined space.
    pub class_names: Vec<String>,
    /// Samples per split.
    pub splits: BTreeMap<Split, Vec<SampleRef>>,
    /// Source files skipped because their labels could not be used.
    pub skipped: Vec<PathBuf>,
}

impl DatasetView {
    /// A view that hands an existing dataset to the engine unchanged.
    pub fn passthrough(descriptor: PathBuf, kind: TaskKind, class_names: Vec<String>) -> Self {
        Self {
            kind,
            descriptor,
            class_names,
            splits: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    /// Samples of a split.
    pub fn samples(&self, split: Split) -> &[SampleRef] {
        self.splits.get(&split).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of samples of a split from one source.
    pub fn count(&self, split: Split, provenance: Provenance) -> usize {
        self.samples(split)
            .iter()
            .filter(|s| s.provenance == provenance)
            .count()
    }

    /// Whether the view enumerates its samples.
    pub fn is_enumerated(&self) -> bool {
        !self.splits.is_empty()
    }
}

/// Where and how a view is written.
pub struct MixOptions<'a> {
    /// Scratch directory owned by the run.
    pub work_dir: &'a Path,
    /// File placement strategy.
    pub materializer: &'a dyn Materializer,
}

/// Rewrite a label file's class ids through the mapping.
///
/// Each line is `class x y w h` (segmentation adds polygon points). Empty
/// lines are dropped. Any malformed line or unmapped id rejects the file.
pub fn remap_label_content(content: &str, mapping: &LabelSpaceMapping) -> Result<String, String> {
    let mut out = String::with_capacity(content.len());
    for (lineno, line) in content.lines().enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 5 {
            return Err(format!("line {}: expected at least 5 fields", lineno + 1));
        }
        let class_id: usize = parts[0]
            .parse()
            .map_err(|_| format!("line {}: invalid class id '{}'", lineno + 1, parts[0]))?;
        if let Some(bad) = parts[1..].iter().find(|p| p.parse::<f64>().is_err()) {
            return Err(format!("line {}: invalid coordinate '{}'", lineno + 1, bad));
        }
        let combined = mapping
            .remap_class_id(class_id)
            .ok_or_else(|| format!("line {}: class id {} outside the taxonomy", lineno + 1, class_id))?;
        out.push_str(&combined.to_string());
        for p in &parts[1..] {
            out.push(' ');
            out.push_str(p);
        }
        out.push('\n');
    }
    Ok(out)
}

fn label_path(label_dir: Option<&Path>, image: &Path) -> Option<PathBuf> {
    let stem = image.file_stem()?;
    let mut name = stem.to_os_string();
    name.push(".txt");
    label_dir.map(|dir| dir.join(name))
}

fn file_name(path: &Path) -> ContinualResult<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        ContinualError::DatasetError(format!("Path has no file name: {}", path.display()))
    })
}

/// Mirror the new dataset with labels rewritten into the combined space.
fn mirror_new_detection(
    new_source: &Path,
    mapping: &LabelSpaceMapping,
    options: &MixOptions<'_>,
    skipped: &mut Vec<PathBuf>,
) -> ContinualResult<BTreeMap<Split, Vec<SampleRef>>> {
    let descriptor = DatasetDescriptor::load(new_source)?;
    let mirror_root = options.work_dir.join(NEW_MIRROR_DIR);
    let mut splits = BTreeMap::new();

    for split in Split::ALL {
        let Some(image_dir) = descriptor.split_dir(split) else {
            continue;
        };
        if !image_dir.is_dir() {
            return Err(ContinualError::DatasetError(format!(
                "New dataset {} images not found at {}",
                split.as_str(),
                image_dir.display()
            )));
        }
        let label_dir = label_dir_for(&image_dir).filter(|d| d.is_dir());
        if label_dir.is_none() {
            warn!(split = split.as_str(), dir = %image_dir.display(), "new dataset split has no label directory");
        }
        let mirror_images = mirror_root.join("images").join(split.as_str());
        let mirror_labels = mirror_root.join("labels").join(split.as_str());
        fs::create_dir_all(&mirror_images)?;
        fs::create_dir_all(&mirror_labels)?;

        let mut samples = Vec::new();
        for image in list_images(&image_dir)? {
            let name = file_name(&image)?;
            let mirrored_image = mirror_images.join(name);
            let mut mirrored_label = None;

            if let Some(source_label) = label_path(label_dir.as_deref(), &image).filter(|p| p.is_file()) {
                let content = match fs::read_to_string(&source_label) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(label = %source_label.display(), error = %e, "unreadable label, skipping sample");
                        skipped.push(image);
                        continue;
                    }
                };
                let remapped = match remap_label_content(&content, mapping) {
                    Ok(r) => r,
                    Err(reason) => {
                        warn!(label = %source_label.display(), %reason, "malformed label, skipping sample");
                        skipped.push(image);
                        continue;
                    }
                };
                let target = label_path(Some(mirror_labels.as_path()), &image).unwrap_or_else(|| mirror_labels.join(name));
                fs::write(&target, remapped)?;
                mirrored_label = Some(target);
            }

            options.materializer.place(&image, &mirrored_image)?;
            samples.push(SampleRef {
                image: mirrored_image,
                label: mirrored_label,
                class_name: None,
                provenance: Provenance::New,
            });
        }
        splits.insert(split, samples);
    }

    Ok(splits)
}

/// Old-dataset samples of a split; `ratio` applies to the training split only.
fn collect_old_detection(
    descriptor: &DatasetDescriptor,
    split: Split,
    ratio: f64,
    rng: &mut StdRng,
) -> ContinualResult<Vec<SampleRef>> {
    let Some(image_dir) = descriptor.split_dir(split) else {
        return Ok(Vec::new());
    };
    if !image_dir.is_dir() {
        return Err(ContinualError::DatasetError(format!(
            "Old dataset {} images not found at {}",
            split.as_str(),
            image_dir.display()
        )));
    }
    let label_dir = label_dir_for(&image_dir)
        .filter(|d| d.is_dir())
        .ok_or_else(|| {
            ContinualError::DatasetError(format!(
                "Old dataset label directory for {} cannot be located",
                image_dir.display()
            ))
        })?;

    let images = list_images(&image_dir)?;
    let chosen: Vec<PathBuf> = if split == Split::Train {
        let k = (images.len() as f64 * ratio.clamp(0.0, 1.0)).floor() as usize;
        sample_indices(images.len(), k, rng)
            .into_iter()
            .map(|i| images[i].clone())
            .collect()
    } else {
        images
    };

    Ok(chosen
        .into_iter()
        .map(|image| {
            let label = label_path(Some(label_dir.as_path()), &image).filter(|p| p.is_file());
            SampleRef {
                image,
                label,
                class_name: None,
                provenance: Provenance::Old,
            }
        })
        .collect())
}

fn write_index(path: &Path, samples: &[SampleRef]) -> ContinualResult<()> {
    let mut content = String::new();
    for s in samples {
        content.push_str(&s.image.display().to_string());
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

fn build_detection(
    old_source: Option<&Path>,
    new_source: &Path,
    mapping: &LabelSpaceMapping,
    kind: TaskKind,
    ratio: f64,
    options: &MixOptions<'_>,
    rng: &mut StdRng,
) -> ContinualResult<DatasetView> {
    let mut skipped = Vec::new();
    let mut new_splits = mirror_new_detection(new_source, mapping, options, &mut skipped)?;
    let old_descriptor = old_source.map(DatasetDescriptor::load).transpose()?;

    let mut splits = BTreeMap::new();
    for split in Split::ALL {
        let mut samples = Vec::new();
        if let (Some(old), true) = (&old_descriptor, split != Split::Test) {
            samples.extend(collect_old_detection(old, split, ratio, rng)?);
        }
        samples.extend(new_splits.remove(&split).unwrap_or_default());
        if !samples.is_empty() {
            splits.insert(split, samples);
        }
    }

    let mut descriptor = DatasetDescriptor {
        nc: Some(mapping.num_classes()),
        names: ClassNames::List(mapping.combined_names.clone()),
        ..Default::default()
    };
    for (split, samples) in &splits {
        let index = options.work_dir.join(format!("{}.txt", split.as_str()));
        write_index(&index, samples)?;
        match split {
            Split::Train => descriptor.train = Some(index),
            Split::Val => descriptor.val = Some(index),
            Split::Test => descriptor.test = Some(index),
        }
    }
    let descriptor_path = options.work_dir.join(MIXED_DESCRIPTOR);
    descriptor.save(&descriptor_path)?;

    Ok(DatasetView {
        kind,
        descriptor: descriptor_path,
        class_names: mapping.combined_names.clone(),
        splits,
        skipped,
    })
}

fn build_classification(
    old_source: Option<&Path>,
    new_source: &Path,
    mapping: &LabelSpaceMapping,
    ratio: f64,
    options: &MixOptions<'_>,
    rng: &mut StdRng,
) -> ContinualResult<DatasetView> {
    let merged = options.work_dir.join(MERGED_CLASSIFY_DIR);
    let mut splits: BTreeMap<Split, Vec<SampleRef>> = BTreeMap::new();
    let sources: Vec<(&Path, Provenance)> = old_source
        .map(|p| (p, Provenance::Old))
        .into_iter()
        .chain(std::iter::once((new_source, Provenance::New)))
        .collect();

    for split in Split::ALL {
        for &(source, provenance) in &sources {
            let Some(src_dir) = classification_split_dir(source, split)? else {
                if split == Split::Train {
                    return Err(ContinualError::DatasetError(format!(
                        "Class folders of {} cannot be located",
                        source.display()
                    )));
                }
                continue;
            };

            for class_dir in list_subdirs(&src_dir)? {
                let class_name = file_name(&class_dir)?.to_string_lossy().into_owned();
                let images = list_images(&class_dir)?;
                let selected: Vec<&PathBuf> = if provenance == Provenance::Old && split == Split::Train {
                    let k = (images.len() as f64 * ratio.clamp(0.0, 1.0)).floor() as usize;
                    sample_indices(images.len(), k, rng)
                        .into_iter()
                        .map(|i| &images[i])
                        .collect()
                } else {
                    images.iter().collect()
                };

                let target_dir = merged.join(split.as_str()).join(&class_name);
                fs::create_dir_all(&target_dir)?;
                for image in selected {
                    let mut name = std::ffi::OsString::from(provenance.file_prefix());
                    name.push(file_name(image)?);
                    let dst = target_dir.join(name);
                    options.materializer.place(image, &dst)?;
                    splits.entry(split).or_default().push(SampleRef {
                        image: dst,
                        label: None,
                        class_name: Some(class_name.clone()),
                        provenance,
                    });
                }
            }
        }
    }

    Ok(DatasetView {
        kind: TaskKind::Classify,
        descriptor: merged,
        class_names: mapping.combined_names.clone(),
        splits,
        skipped: Vec::new(),
    })
}

/// Build the dataset view of a reconciled run.
///
/// `old_sample_ratio` is the fraction of old training samples mixed in;
/// `old_source` may be absent when only the new dataset is remapped.
pub fn build_mixed_dataset(
    old_source: Option<&Path>,
    new_source: &Path,
    mapping: &LabelSpaceMapping,
    kind: TaskKind,
    old_sample_ratio: f64,
    options: &MixOptions<'_>,
    rng: &mut StdRng,
) -> ContinualResult<DatasetView> {
    fs::create_dir_all(options.work_dir)?;
    let view = if kind.uses_label_files() {
        build_detection(old_source, new_source, mapping, kind, old_sample_ratio, options, rng)?
    } else {
        build_classification(old_source, new_source, mapping, old_sample_ratio, options, rng)?
    };

    info!(
        kind = kind.as_str(),
        materializer = options.materializer.name(),
        train_old = view.count(Split::Train, Provenance::Old),
        train_new = view.count(Split::Train, Provenance::New),
        val = view.samples(Split::Val).len(),
        skipped = view.skipped.len(),
        "built reconciled dataset"
    );
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::descriptor::Taxonomy;
    use crate::reconcile::materialize::CopyOnly;
    use scirs2_core::random::SeedableRng;

    fn mapping(old: &[&str], new: &[&str]) -> LabelSpaceMapping {
        let t = |names: &[&str]| Taxonomy::new(names.iter().map(|s| s.to_string()).collect()).unwrap();
        LabelSpaceMapping::analyze(&t(old), &t(new))
    }

    fn write_detection_dataset(root: &Path, names: &[&str], train: &[(&str, &str)], val: &[(&str, &str)]) -> PathBuf {
        for (split, files) in [("train", train), ("val", val)] {
            let images = root.join("images").join(split);
            let labels = root.join("labels").join(split);
            fs::create_dir_all(&images).unwrap();
            fs::create_dir_all(&labels).unwrap();
            for (stem, label) in files.iter() {
                fs::write(images.join(format!("{}.jpg", stem)), b"img").unwrap();
                fs::write(labels.join(format!("{}.txt", stem)), label).unwrap();
            }
        }
        let yaml = root.join("data.yaml");
        fs::write(
            &yaml,
            format!("train: images/train\nval: images/val\nnames: [{}]\n", names.join(", ")),
        )
        .unwrap();
        yaml
    }

    #[test]
    fn test_remap_label_content() {
        let m = mapping(&["cat", "dog"], &["dog", "bird"]);
        let out = remap_label_content("0 0.5 0.5 0.1 0.1\n\n1 0.2 0.2 0.3 0.3\n", &m).unwrap();
        assert_eq!(out, "1 0.5 0.5 0.1 0.1\n2 0.2 0.2 0.3 0.3\n");

        assert!(remap_label_content("x 0.5 0.5 0.1 0.1", &m).is_err());
        assert!(remap_label_content("0 0.5 0.5", &m).is_err());
        assert!(remap_label_content("7 0.5 0.5 0.1 0.1", &m).is_err());
    }

    #[test]
    fn test_detection_mix_counts_and_remap() {
        let dir = tempfile::tempdir().unwrap();
        let old_train: Vec<(String, &str)> = (0..10).map(|i| (format!("o{}", i), "0 0.5 0.5 0.2 0.2\n")).collect();
        let old_train_ref: Vec<(&str, &str)> = old_train.iter().map(|(a, b)| (a.as_str(), *b)).collect();
        let old = write_detection_dataset(
            &dir.path().join("old"),
            &["cat", "dog"],
            &old_train_ref,
            &[("ov", "1 0.5 0.5 0.2 0.2\n")],
        );
        let new = write_detection_dataset(
            &dir.path().join("new"),
            &["dog", "bird"],
            &[("n1", "1 0.5 0.5 0.2 0.2\n"), ("n2", "bad line\n")],
            &[("nv", "0 0.1 0.1 0.1 0.1\n")],
        );
        let m = mapping(&["cat", "dog"], &["dog", "bird"]);
        let work = dir.path().join("work");
        let options = MixOptions {
            work_dir: &work,
            materializer: &CopyOnly,
        };
        let mut rng = StdRng::seed_from_u64(3);

        let view = build_mixed_dataset(Some(&old), &new, &m, TaskKind::Detect, 0.2, &options, &mut rng).unwrap();

        assert_eq!(view.count(Split::Train, Provenance::Old), 2);
        assert_eq!(view.count(Split::Train, Provenance::New), 1);
        assert_eq!(view.count(Split::Val, Provenance::Old), 1);
        assert_eq!(view.count(Split::Val, Provenance::New), 1);
        assert_eq!(view.skipped.len(), 1);

        let mirrored = view
            .samples(Split::Train)
            .iter()
            .find(|s| s.provenance == Provenance::New)
            .unwrap();
        let label = fs::read_to_string(mirrored.label.as_ref().unwrap()).unwrap();
        assert!(label.starts_with("2 "));

        let descriptor = DatasetDescriptor::load(&view.descriptor).unwrap();
        assert_eq!(descriptor.nc, Some(3));
        assert_eq!(descriptor.class_names(), vec!["cat", "dog", "bird"]);
        let train_index = fs::read_to_string(descriptor.train.unwrap()).unwrap();
        assert_eq!(train_index.lines().count(), 3);
    }

    #[test]
    fn test_missing_old_labels_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("old");
        fs::create_dir_all(old_root.join("images/train")).unwrap();
        fs::write(old_root.join("images/train/a.jpg"), b"img").unwrap();
        let old = old_root.join("data.yaml");
        fs::write(&old, "train: images/train\nnames: [cat]\n").unwrap();
        let new = write_detection_dataset(&dir.path().join("new"), &["cat"], &[("n", "0 0.5 0.5 0.1 0.1\n")], &[]);

        let m = mapping(&["cat"], &["cat"]);
        let work = dir.path().join("work");
        let options = MixOptions {
            work_dir: &work,
            materializer: &CopyOnly,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = build_mixed_dataset(Some(&old), &new, &m, TaskKind::Detect, 0.5, &options, &mut rng).unwrap_err();
        assert!(matches!(err, ContinualError::DatasetError(_)));
    }

    #[test]
    fn test_classification_merge_with_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        for i in 0..5 {
            let p = old.join("train/cat");
            fs::create_dir_all(&p).unwrap();
            fs::write(p.join(format!("{}.jpg", i)), b"c").unwrap();
        }
        fs::create_dir_all(old.join("val/cat")).unwrap();
        fs::write(old.join("val/cat/v.jpg"), b"c").unwrap();
        fs::create_dir_all(new.join("train/cat")).unwrap();
        fs::write(new.join("train/cat/0.jpg"), b"n").unwrap();
        fs::create_dir_all(new.join("train/fox")).unwrap();
        fs::write(new.join("train/fox/f.png"), b"f").unwrap();
        fs::write(new.join("train/fox/notes.txt"), b"x").unwrap();

        let m = mapping(&["cat"], &["cat", "fox"]);
        let work = dir.path().join("work");
        let options = MixOptions {
            work_dir: &work,
            materializer: &CopyOnly,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let view = build_mixed_dataset(Some(&old), &new, &m, TaskKind::Classify, 0.4, &options, &mut rng).unwrap();

        assert_eq!(view.count(Split::Train, Provenance::Old), 2);
        assert_eq!(view.count(Split::Train, Provenance::New), 2);
        assert_eq!(view.count(Split::Val, Provenance::Old), 1);
        let merged = work.join(MERGED_CLASSIFY_DIR);
        assert!(merged.join("train/cat/new_0.jpg").is_file());
        assert!(merged.join("train/fox/new_f.png").is_file());
        assert!(merged.join("val/cat/old_v.jpg").is_file());
        assert_eq!(view.descriptor, merged);
    }
}
