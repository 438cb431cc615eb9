//! Model interface consumed by the scheduler, the reconciler and the engine.
//!
//! The orchestration layer never runs a forward pass. It only needs to see
//! named parameter tensors, toggle whether they receive gradient updates,
//! swap the classification head, and persist weights.

use crate::{ContinualError, ContinualResult};
use scirs2_core::ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Named parameter tensors of a model.
pub type ParameterMap = HashMap<String, Array2<f64>>;

/// Final classification layer: one weight row and one bias per class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationHead {
    /// Weight matrix, `num_classes x in_features`.
    pub weight: Array2<f64>,
    /// Bias vector, `num_classes`.
    pub bias: Array1<f64>,
}

impl ClassificationHead {
    /// Create a zero-initialized head.
    pub fn zeros(num_classes: usize, in_features: usize) -> Self {
        Self {
            weight: Array2::zeros((num_classes, in_features)),
            bias: Array1::zeros(num_classes),
        }
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.weight.nrows()
    }

    /// Width of the input features.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }
}

/// Trait for models whose weights are staged, adapted and persisted.
pub trait Model: Send {
    /// Get a reference to the model's parameters.
    fn parameters(&self) -> &ParameterMap;

    /// Get a mutable reference to the model's parameters.
    fn parameters_mut(&mut self) -> &mut ParameterMap;

    /// Whether the named parameter receives gradient updates.
    fn requires_grad(&self, name: &str) -> bool;

    /// Enable or disable gradient updates for the named parameter.
    fn set_requires_grad(&mut self, name: &str, enabled: bool);

    /// Class names in head-row order.
    fn class_names(&self) -> &[String];

    /// Replace the class names.
    fn set_class_names(&mut self, names: Vec<String>);

    /// Current classification head, if the model has one.
    fn head(&self) -> Option<ClassificationHead>;

    /// Install a new classification head.
    fn replace_head(&mut self, head: ClassificationHead) -> ContinualResult<()>;

    /// Parameter prefix of the classification head.
    fn head_name(&self) -> &str;

    /// Get the number of parameters in the model.
    fn num_parameters(&self) -> usize {
        self.parameters().values().map(|p| p.len()).sum()
    }

    /// Number of parameters that currently receive gradient updates.
    fn num_trainable_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|(name, _)| self.requires_grad(name))
            .map(|(_, p)| p.len())
            .sum()
    }

    /// Disable gradient updates for every parameter.
    fn freeze_all(&mut self) {
        let names: Vec<String> = self.parameters().keys().cloned().collect();
        for name in names {
            self.set_requires_grad(&name, false);
        }
    }

    /// Toggle every parameter in a group; returns the number of tensors touched.
    ///
    /// A parameter belongs to group `id` when its name equals `id` or starts
    /// with `id` followed by a dot.
    fn set_group_trainable(&mut self, id: &str, trainable: bool) -> usize {
        let names: Vec<String> = self
            .parameters()
            .keys()
            .filter(|name| belongs_to_group(name, id))
            .cloned()
            .collect();
        for name in &names {
            self.set_requires_grad(name, trainable);
        }
        names.len()
    }

    /// Whether any parameter belongs to group `id`.
    fn has_group(&self, id: &str) -> bool {
        self.parameters().keys().any(|name| belongs_to_group(name, id))
    }

    /// Sorted module names (parameter names without their last segment).
    fn parameter_groups(&self) -> Vec<String> {
        self.parameters()
            .keys()
            .map(|name| {
                name.rsplit_once('.')
                    .map_or(name.as_str(), |(prefix, _)| prefix)
                    .to_string()
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Save model state to a dictionary.
    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        self.parameters()
            .iter()
            .map(|(name, param)| (name.clone(), param.iter().copied().collect()))
            .collect()
    }

    /// Load model state from a dictionary.
    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>) -> ContinualResult<()> {
        let parameters = self.parameters_mut();

        for (name, values) in state {
            let param = parameters.get_mut(&name).ok_or_else(|| {
                ContinualError::InvalidParameter(format!("Parameter '{}' not found in model", name))
            })?;
            if param.len() != values.len() {
                return Err(ContinualError::InvalidParameter(format!(
                    "Parameter '{}' size mismatch: expected {}, got {}",
                    name,
                    param.len(),
                    values.len()
                )));
            }
            for (p, v) in param.iter_mut().zip(values) {
                *p = v;
            }
        }

        Ok(())
    }
}

/// Whether parameter `name` is part of group `id`.
pub fn belongs_to_group(name: &str, id: &str) -> bool {
    name == id
        || name
            .strip_prefix(id)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// A model made of named layers followed by a classification head.
///
/// The head is stored as the `{head}.weight` (`classes x in`) and
/// `{head}.bias` (`1 x classes`) parameters.
#[derive(Debug, Clone)]
pub struct SequentialModel {
    parameters: ParameterMap,
    frozen: HashSet<String>,
    class_names: Vec<String>,
    head_prefix: String,
}

impl SequentialModel {
    /// Create a model with no layers and the given head prefix.
    pub fn new(head_prefix: impl Into<String>) -> Self {
        Self {
            parameters: HashMap::new(),
            frozen: HashSet::new(),
            class_names: Vec::new(),
            head_prefix: head_prefix.into(),
        }
    }

    /// Add a layer with a zero `weight` of shape `rows x cols` and a zero bias.
    pub fn with_layer(mut self, name: &str, rows: usize, cols: usize) -> Self {
        self.parameters
            .insert(format!("{}.weight", name), Array2::zeros((rows, cols)));
        self.parameters
            .insert(format!("{}.bias", name), Array2::zeros((1, cols)));
        self
    }

    /// Add a zero-initialized head for `class_names`.
    pub fn with_head(mut self, in_features: usize, class_names: Vec<String>) -> Self {
        let head = ClassificationHead::zeros(class_names.len(), in_features);
        self.install_head(head);
        self.class_names = class_names;
        self
    }

    fn head_weight_key(&self) -> String {
        format!("{}.weight", self.head_prefix)
    }

    fn head_bias_key(&self) -> String {
        format!("{}.bias", self.head_prefix)
    }

    fn install_head(&mut self, head: ClassificationHead) {
        let weight_key = self.head_weight_key();
        let bias_key = self.head_bias_key();
        self.frozen.remove(&weight_key);
        self.frozen.remove(&bias_key);
        self.parameters.insert(weight_key, head.weight);
        self.parameters
            .insert(bias_key, head.bias.insert_axis(Axis(0)));
    }
}

impl Model for SequentialModel {
    fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterMap {
        &mut self.parameters
    }

    fn requires_grad(&self, name: &str) -> bool {
        self.parameters.contains_key(name) && !self.frozen.contains(name)
    }

    fn set_requires_grad(&mut self, name: &str, enabled: bool) {
        if !self.parameters.contains_key(name) {
            return;
        }
        if enabled {
            self.frozen.remove(name);
        } else {
            self.frozen.insert(name.to_string());
        }
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn set_class_names(&mut self, names: Vec<String>) {
        self.class_names = names;
    }

    fn head(&self) -> Option<ClassificationHead> {
        let weight = self.parameters.get(&self.head_weight_key())?;
        let bias = self.parameters.get(&self.head_bias_key())?;
        Some(ClassificationHead {
            weight: weight.clone(),
            bias: bias.row(0).to_owned(),
        })
    }

    fn replace_head(&mut self, head: ClassificationHead) -> ContinualResult<()> {
        if head.bias.len() != head.num_classes() {
            return Err(ContinualError::ModelError(format!(
                "Head bias has {} entries for {} classes",
                head.bias.len(),
                head.num_classes()
            )));
        }
        self.install_head(head);
        Ok(())
    }

    fn head_name(&self) -> &str {
        &self.head_prefix
    }
}

/// Serialized tensor: shape plus row-major values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    /// `[rows, cols]`.
    pub shape: [usize; 2],
    /// Row-major values.
    pub values: Vec<f64>,
}

/// On-disk form of a model: weights, frozen flags and class names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Head parameter prefix.
    pub head_prefix: String,
    /// Class names in head-row order.
    pub class_names: Vec<String>,
    /// Parameters by name.
    pub parameters: BTreeMap<String, TensorData>,
    /// Names of parameters excluded from gradient updates.
    #[serde(default)]
    pub frozen: Vec<String>,
}

impl ModelArtifact {
    /// Capture the weights of any model.
    pub fn from_model(model: &dyn Model) -> Self {
        let parameters = model
            .parameters()
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    TensorData {
                        shape: [p.nrows(), p.ncols()],
                        values: p.iter().copied().collect(),
                    },
                )
            })
            .collect();
        let mut frozen: Vec<String> = model
            .parameters()
            .keys()
            .filter(|name| !model.requires_grad(name))
            .cloned()
            .collect();
        frozen.sort();
        Self {
            head_prefix: model.head_name().to_string(),
            class_names: model.class_names().to_vec(),
            parameters,
            frozen,
        }
    }

    /// Rebuild a [`SequentialModel`].
    pub fn into_model(self) -> ContinualResult<SequentialModel> {
        let mut model = SequentialModel::new(self.head_prefix);
        for (name, tensor) in self.parameters {
            let array = Array2::from_shape_vec((tensor.shape[0], tensor.shape[1]), tensor.values)
                .map_err(|e| {
                    ContinualError::CheckpointError(format!(
                        "Failed to reshape parameter '{}': {}",
                        name, e
                    ))
                })?;
            model.parameters.insert(name, array);
        }
        for name in self.frozen {
            model.set_requires_grad(&name, false);
        }
        model.class_names = self.class_names;
        Ok(model)
    }

    /// Copy these weights into an existing model with identical shapes.
    pub fn apply_to(&self, model: &mut dyn Model) -> ContinualResult<()> {
        let state = self
            .parameters
            .iter()
            .map(|(name, t)| (name.clone(), t.values.clone()))
            .collect();
        model.load_state_dict(state)
    }

    /// Write as JSON.
    pub fn save(&self, path: &Path) -> ContinualResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self).map_err(|e| {
            ContinualError::Serialization(format!("Failed to serialize model: {}", e))
        })?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read from JSON.
    pub fn load(path: &Path) -> ContinualResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            ContinualError::CheckpointError(format!(
                "Failed to read model {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            ContinualError::Serialization(format!("Failed to parse model {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn small_model() -> SequentialModel {
        SequentialModel::new("head")
            .with_layer("model.0", 4, 3)
            .with_layer("model.1", 3, 3)
            .with_head(3, names(&["cat", "dog"]))
    }

    #[test]
    fn test_group_membership() {
        assert!(belongs_to_group("model.1.weight", "model.1"));
        assert!(belongs_to_group("model.1", "model.1"));
        assert!(!belongs_to_group("model.10.weight", "model.1"));
        assert!(!belongs_to_group("model.1weight", "model.1"));
    }

    #[test]
    fn test_freeze_and_unfreeze_groups() {
        let mut model = small_model();
        let total = model.num_parameters();
        assert_eq!(model.num_trainable_parameters(), total);

        model.freeze_all();
        assert_eq!(model.num_trainable_parameters(), 0);

        let touched = model.set_group_trainable("model.1", true);
        assert_eq!(touched, 2);
        // 3x3 weight + 1x3 bias
        assert_eq!(model.num_trainable_parameters(), 12);
        assert!(model.has_group("model.0"));
        assert!(!model.has_group("model.7"));
    }

    #[test]
    fn test_parameter_groups_sorted() {
        let model = small_model();
        assert_eq!(model.parameter_groups(), names(&["head", "model.0", "model.1"]));
    }

    #[test]
    fn test_head_roundtrip() {
        let mut model = small_model();
        let mut head = model.head().unwrap();
        assert_eq!(head.num_classes(), 2);
        assert_eq!(head.in_features(), 3);

        head.weight[[1, 2]] = 0.5;
        head.bias[1] = -1.0;
        model.replace_head(head.clone()).unwrap();
        assert_eq!(model.head().unwrap(), head);
    }

    #[test]
    fn test_replace_head_rejects_bias_mismatch() {
        let mut model = small_model();
        let head = ClassificationHead {
            weight: Array2::zeros((3, 3)),
            bias: Array1::zeros(2),
        };
        assert!(model.replace_head(head).is_err());
    }

    #[test]
    fn test_load_state_dict_size_mismatch() {
        let mut model = small_model();
        let mut state = HashMap::new();
        state.insert("model.0.weight".to_string(), vec![1.0; 3]);
        assert!(model.load_state_dict(state).is_err());
    }

    #[test]
    fn test_artifact_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights").join("final.json");

        let mut model = small_model();
        model.parameters_mut().get_mut("model.0.weight").unwrap()[[2, 1]] = 7.0;
        model.set_requires_grad("model.0.weight", false);

        ModelArtifact::from_model(&model).save(&path).unwrap();
        let restored = ModelArtifact::load(&path).unwrap().into_model().unwrap();

        assert_eq!(restored.parameters()["model.0.weight"][[2, 1]], 7.0);
        assert!(!restored.requires_grad("model.0.weight"));
        assert!(restored.requires_grad("model.1.weight"));
        assert_eq!(restored.class_names(), model.class_names());
    }
}
