//! Dataset descriptors and class taxonomies.
//!
//! Detection and segmentation datasets are described by a YAML file:
//!
//! ```yaml
//! path: /data/shapes      # optional, defaults to the YAML's directory
//! train: images/train
//! val: images/val
//! names: [circle, square] # or {0: circle, 1: square}
//! ```
//!
//! Labels live in a parallel directory where the `images` path component is
//! replaced by `labels`. Classification datasets are directories with one
//! sub-folder per class inside each split.

use crate::config::TaskKind;
use crate::{ContinualError, ContinualResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Image file extensions considered part of a dataset.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training split.
    Train,
    /// Validation split.
    Val,
    /// Test split.
    Test,
}

impl Split {
    /// All splits in canonical order.
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    /// Directory and key name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

/// Class names as either a list or an index map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassNames {
    /// `[a, b, c]`
    List(Vec<String>),
    /// `{0: a, 1: b}`
    Map(BTreeMap<usize, String>),
}

impl Default for ClassNames {
    fn default() -> Self {
        ClassNames::List(Vec::new())
    }
}

impl ClassNames {
    /// Names ordered by class index.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ClassNames::List(names) => names.clone(),
            ClassNames::Map(map) => map.values().cloned().collect(),
        }
    }
}

/// YAML dataset descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Dataset root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Training images, relative to the root (or an index file).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<PathBuf>,
    /// Validation images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<PathBuf>,
    /// Test images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<PathBuf>,
    /// Number of classes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nc: Option<usize>,
    /// Class names.
    #[serde(default)]
    pub names: ClassNames,
    /// Directory the descriptor was loaded from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl DatasetDescriptor {
    /// Load a descriptor from a YAML file.
    pub fn load(path: &Path) -> ContinualResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ContinualError::DatasetError(format!(
                "Failed to read dataset descriptor {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut descriptor: Self = serde_yaml::from_str(&content).map_err(|e| {
            ContinualError::DatasetError(format!(
                "Failed to parse dataset descriptor {}: {}",
                path.display(),
                e
            ))
        })?;
        descriptor.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(descriptor)
    }

    /// Write as YAML.
    pub fn save(&self, path: &Path) -> ContinualResult<()> {
        let yaml = serde_yaml::to_string(self).map_err(|e| {
            ContinualError::Serialization(format!("Failed to serialize descriptor: {}", e))
        })?;
        fs::write(path, yaml)?;
        Ok(())
    }

    /// Dataset root directory.
    pub fn root(&self) -> PathBuf {
        match &self.path {
            Some(p) => self.base_dir.join(p),
            None => self.base_dir.clone(),
        }
    }

    /// Entry for a split, if declared.
    pub fn split_entry(&self, split: Split) -> Option<&PathBuf> {
        match split {
            Split::Train => self.train.as_ref(),
            Split::Val => self.val.as_ref(),
            Split::Test => self.test.as_ref(),
        }
    }

    /// Image directory of a split, if declared.
    pub fn split_dir(&self, split: Split) -> Option<PathBuf> {
        self.split_entry(split).map(|entry| self.root().join(entry))
    }

    /// Class names ordered by index.
    pub fn class_names(&self) -> Vec<String> {
        self.names.to_vec()
    }
}

/// Label directory paired with an image directory.
///
/// The last `images` component is replaced by `labels`.
pub fn label_dir_for(image_dir: &Path) -> Option<PathBuf> {
    let components: Vec<Component<'_>> = image_dir.components().collect();
    let idx = components
        .iter()
        .rposition(|c| c.as_os_str() == OsStr::new("images"))?;
    let mut out = PathBuf::new();
    for (i, c) in components.iter().enumerate() {
        if i == idx {
            out.push("labels");
        } else {
            out.push(c.as_os_str());
        }
    }
    Some(out)
}

/// Whether `path` has one of the dataset image extensions.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Sorted image files directly inside `dir`.
pub fn list_images(dir: &Path) -> ContinualResult<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Sorted sub-directories of `dir`.
pub fn list_subdirs(dir: &Path) -> ContinualResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Resolve the class-folder directory of a classification split.
///
/// `source` is a YAML descriptor or a directory. A directory without split
/// sub-folders is treated as the training split.
pub fn classification_split_dir(source: &Path, split: Split) -> ContinualResult<Option<PathBuf>> {
    let dir = if source.is_file() {
        let descriptor = DatasetDescriptor::load(source)?;
        match descriptor.split_dir(split) {
            Some(dir) => Some(dir),
            None if split == Split::Train => Some(descriptor.root()),
            None => None,
        }
    } else if source.is_dir() {
        let candidate = source.join(split.as_str());
        if candidate.is_dir() {
            Some(candidate)
        } else if split == Split::Train {
            Some(source.to_path_buf())
        } else {
            None
        }
    } else {
        None
    };
    Ok(dir.filter(|d| d.is_dir()))
}

/// Ordered, duplicate-free list of class names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    names: Vec<String>,
}

impl Taxonomy {
    /// Create a taxonomy; duplicate names are a configuration error.
    pub fn new(names: Vec<String>) -> ContinualResult<Self> {
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(ContinualError::ConfigError(format!(
                    "Duplicate class name '{}' in taxonomy",
                    name
                )));
            }
        }
        Ok(Self { names })
    }

    /// Load the taxonomy of a dataset.
    ///
    /// Detection and segmentation read `names` from the descriptor;
    /// classification uses the sorted class folders of the training split.
    pub fn load(source: &Path, kind: TaskKind) -> ContinualResult<Self> {
        if kind.uses_label_files() {
            let descriptor = DatasetDescriptor::load(source)?;
            return Self::new(descriptor.class_names());
        }

        let train_dir = classification_split_dir(source, Split::Train)?.ok_or_else(|| {
            ContinualError::DatasetError(format!(
                "No training class folders found for {}",
                source.display()
            ))
        })?;
        let names = list_subdirs(&train_dir)?
            .into_iter()
            .filter_map(|d| d.file_name().and_then(OsStr::to_str).map(str::to_string))
            .collect();
        Self::new(names)
    }

    /// Class names in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether there are no classes.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of a class name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}
