//! Widening a trained model's classification head to the combined label space.

use crate::config::TaskKind;
use crate::model::{ClassificationHead, Model};
use crate::reconcile::mapping::LabelSpaceMapping;
use crate::{ContinualError, ContinualResult};
use scirs2_core::ndarray::{Array1, Array2};
use scirs2_core::random::{Rng, StdRng};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of adapting a model head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadAdaptation {
    /// Whether a new head was installed.
    pub replaced: bool,
    /// Head width before adaptation.
    pub previous_classes: usize,
    /// Head width after adaptation.
    pub combined_classes: usize,
    /// Classes whose weights were carried over.
    pub copied: Vec<String>,
    /// Classes that start from fresh weights.
    pub initialized: Vec<String>,
}

/// Fresh head with weights drawn uniformly from `±1/sqrt(in_features)`.
fn init_head(num_classes: usize, in_features: usize, rng: &mut StdRng) -> ClassificationHead {
    let bound = 1.0 / (in_features.max(1) as f64).sqrt();
    let mut sample = || (rng.random::<f64>() * 2.0 - 1.0) * bound;
    let weight = Array2::from_shape_fn((num_classes, in_features), |_| sample());
    let bias = Array1::from_shape_fn(num_classes, |_| sample());
    ClassificationHead { weight, bias }
}

/// Rebuild the head of `model` for the combined classes of `mapping`.
///
/// Rows of classes the model already knows are copied by name. The head is
/// replaced whenever its width differs from the combined class count, and
/// always for classification. The model's class names become the combined
/// names.
pub fn adapt_model(
    model: &mut dyn Model,
    mapping: &LabelSpaceMapping,
    kind: TaskKind,
    rng: &mut StdRng,
) -> ContinualResult<HeadAdaptation> {
    mapping.check_model_classes(model.class_names())?;

    let head = model.head().ok_or_else(|| {
        ContinualError::ModelError(format!(
            "Model has no classification head named '{}'",
            model.head_name()
        ))
    })?;
    let previous_classes = head.num_classes();
    let combined = &mapping.combined_names;

    if previous_classes == combined.len() && kind != TaskKind::Classify {
        model.set_class_names(combined.clone());
        return Ok(HeadAdaptation {
            replaced: false,
            previous_classes,
            combined_classes: combined.len(),
            copied: combined.clone(),
            initialized: Vec::new(),
        });
    }

    let mut fresh = init_head(combined.len(), head.in_features(), rng);
    let mut copied = Vec::new();
    for (old_row, name) in model.class_names().iter().enumerate() {
        if old_row >= previous_classes {
            break;
        }
        if let Some(new_row) = combined.iter().position(|c| c == name) {
            fresh.weight.row_mut(new_row).assign(&head.weight.row(old_row));
            fresh.bias[new_row] = head.bias[old_row];
            copied.push(name.clone());
        }
    }
    let initialized = combined
        .iter()
        .filter(|name| !copied.contains(name))
        .cloned()
        .collect::<Vec<_>>();

    model.replace_head(fresh)?;
    model.set_class_names(combined.clone());

    info!(
        previous = previous_classes,
        combined = combined.len(),
        copied = copied.len(),
        initialized = initialized.len(),
        "adapted classification head"
    );

    Ok(HeadAdaptation {
        replaced: true,
        previous_classes,
        combined_classes: combined.len(),
        copied,
        initialized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequentialModel;
    use crate::reconcile::descriptor::Taxonomy;
    use scirs2_core::random::SeedableRng;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn mapping(old: &[&str], new: &[&str]) -> LabelSpaceMapping {
        LabelSpaceMapping::analyze(
            &Taxonomy::new(names(old)).unwrap(),
            &Taxonomy::new(names(new)).unwrap(),
        )
    }

    fn trained_model() -> SequentialModel {
        let mut model = SequentialModel::new("head")
            .with_layer("model.0", 4, 4)
            .with_head(4, names(&["cat", "dog"]));
        let mut head = model.head().unwrap();
        head.weight.row_mut(0).fill(1.0);
        head.weight.row_mut(1).fill(2.0);
        head.bias[0] = 0.1;
        head.bias[1] = 0.2;
        model.replace_head(head).unwrap();
        model
    }

    #[test]
    fn test_head_widened_and_rows_preserved() {
        let mut model = trained_model();
        let m = mapping(&["cat", "dog"], &["dog", "bird"]);
        let mut rng = StdRng::seed_from_u64(42);

        let report = adapt_model(&mut model, &m, TaskKind::Detect, &mut rng).unwrap();

        assert!(report.replaced);
        assert_eq!(report.previous_classes, 2);
        assert_eq!(report.combined_classes, 3);
        assert_eq!(report.initialized, names(&["bird"]));

        let head = model.head().unwrap();
        assert_eq!(head.num_classes(), 3);
        assert!(head.weight.row(0).iter().all(|&w| w == 1.0));
        assert!(head.weight.row(1).iter().all(|&w| w == 2.0));
        assert_eq!(head.bias[1], 0.2);
        assert!(head.weight.row(2).iter().all(|&w| w.abs() <= 0.5));
        assert_eq!(model.class_names(), &names(&["cat", "dog", "bird"])[..]);
    }

    #[test]
    fn test_same_width_detection_keeps_head() {
        let mut model = trained_model();
        let m = mapping(&["cat", "dog"], &["dog"]);
        let mut rng = StdRng::seed_from_u64(0);

        let report = adapt_model(&mut model, &m, TaskKind::Detect, &mut rng).unwrap();
        assert!(!report.replaced);
        assert!(model.head().unwrap().weight.row(1).iter().all(|&w| w == 2.0));
    }

    #[test]
    fn test_classification_always_rebuilds() {
        let mut model = trained_model();
        let m = mapping(&["cat", "dog"], &["cat", "dog"]);
        let mut rng = StdRng::seed_from_u64(0);

        let report = adapt_model(&mut model, &m, TaskKind::Classify, &mut rng).unwrap();
        assert!(report.replaced);
        assert_eq!(report.copied, names(&["cat", "dog"]));
    }

    #[test]
    fn test_class_removal_is_rejected_before_mutation() {
        let mut model = trained_model();
        let m = mapping(&["cat"], &["bird"]);
        let mut rng = StdRng::seed_from_u64(0);

        let err = adapt_model(&mut model, &m, TaskKind::Detect, &mut rng).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(model.head().unwrap().num_classes(), 2);
    }
}
