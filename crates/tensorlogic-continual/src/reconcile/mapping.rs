//! Combined label space of an old and a new taxonomy.

use crate::reconcile::descriptor::Taxonomy;
use crate::{ContinualError, ContinualResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Mapping from the new dataset's class ids into the combined class space.
///
/// The combined space always starts with the old names in their original
/// order, so old class ids keep their meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpaceMapping {
    /// Old class names.
    pub old_names: Vec<String>,
    /// New class names.
    pub new_names: Vec<String>,
    /// Old names followed by unseen new names, in first-seen order.
    pub combined_names: Vec<String>,
    /// Combined ids of classes absent from the old taxonomy.
    pub new_class_ids: Vec<usize>,
    /// New-dataset class id to combined class id.
    pub new_to_combined: BTreeMap<usize, usize>,
}

impl LabelSpaceMapping {
    /// Reconcile two taxonomies.
    pub fn analyze(old: &Taxonomy, new: &Taxonomy) -> Self {
        let mut combined_names = old.names().to_vec();
        let mut new_class_ids = Vec::new();
        for name in new.names() {
            if !combined_names.contains(name) {
                new_class_ids.push(combined_names.len());
                combined_names.push(name.clone());
            }
        }

        let new_to_combined = new
            .names()
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                combined_names
                    .iter()
                    .position(|c| c == name)
                    .map(|combined| (i, combined))
            })
            .collect();

        Self {
            old_names: old.names().to_vec(),
            new_names: new.names().to_vec(),
            combined_names,
            new_class_ids,
            new_to_combined,
        }
    }

    /// Combined id of a new-dataset class id.
    pub fn remap_class_id(&self, new_id: usize) -> Option<usize> {
        self.new_to_combined.get(&new_id).copied()
    }

    /// Whether a combined id refers to a class the old taxonomy lacked.
    pub fn is_new_class(&self, combined_id: usize) -> bool {
        self.new_class_ids.contains(&combined_id)
    }

    /// Number of combined classes.
    pub fn num_classes(&self) -> usize {
        self.combined_names.len()
    }

    /// Names of the classes added by the new taxonomy.
    pub fn added_names(&self) -> Vec<&str> {
        self.new_class_ids
            .iter()
            .filter_map(|&id| self.combined_names.get(id).map(String::as_str))
            .collect()
    }

    /// Reject a model that knows classes the combined space would drop.
    pub fn check_model_classes(&self, model_classes: &[String]) -> ContinualResult<()> {
        let combined: HashSet<&str> = self.combined_names.iter().map(String::as_str).collect();
        let removed: Vec<&str> = model_classes
            .iter()
            .map(String::as_str)
            .filter(|name| !combined.contains(name))
            .collect();
        if removed.is_empty() {
            Ok(())
        } else {
            Err(ContinualError::ConfigError(format!(
                "Class removal is not supported; model classes missing from the combined label space: {:?}",
                removed
            )))
        }
    }

    /// Declared new classes that disagree with the analysis.
    ///
    /// Returns `(declared but not new, new but not declared)`.
    pub fn compare_declared(&self, declared: &[String]) -> (Vec<String>, Vec<String>) {
        let added: HashSet<&str> = self.added_names().into_iter().collect();
        let declared_set: HashSet<&str> = declared.iter().map(String::as_str).collect();
        let unexpected = declared
            .iter()
            .filter(|d| !added.contains(d.as_str()))
            .cloned()
            .collect();
        let undeclared = self
            .added_names()
            .into_iter()
            .filter(|a| !declared_set.contains(a))
            .map(str::to_string)
            .collect();
        (unexpected, undeclared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy(names: &[&str]) -> Taxonomy {
        Taxonomy::new(names.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_analyze_reorders_and_appends() {
        let mapping = LabelSpaceMapping::analyze(
            &taxonomy(&["cat", "dog"]),
            &taxonomy(&["dog", "bird", "cat"]),
        );

        assert_eq!(mapping.combined_names, vec!["cat", "dog", "bird"]);
        assert_eq!(mapping.new_class_ids, vec![2]);
        assert_eq!(mapping.remap_class_id(0), Some(1));
        assert_eq!(mapping.remap_class_id(1), Some(2));
        assert_eq!(mapping.remap_class_id(2), Some(0));
        assert_eq!(mapping.remap_class_id(3), None);
        assert!(mapping.is_new_class(2));
        assert!(!mapping.is_new_class(0));
        assert_eq!(mapping.added_names(), vec!["bird"]);
    }

    #[test]
    fn test_identical_taxonomies() {
        let mapping =
            LabelSpaceMapping::analyze(&taxonomy(&["a", "b"]), &taxonomy(&["a", "b"]));
        assert!(mapping.new_class_ids.is_empty());
        assert_eq!(mapping.num_classes(), 2);
        assert_eq!(mapping.remap_class_id(1), Some(1));
    }

    #[test]
    fn test_class_removal_rejected() {
        let mapping = LabelSpaceMapping::analyze(&taxonomy(&["a"]), &taxonomy(&["b"]));
        assert!(mapping.check_model_classes(&["a".to_string()]).is_ok());
        let err = mapping
            .check_model_classes(&["a".to_string(), "z".to_string()])
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("\"z\""));
    }

    #[test]
    fn test_compare_declared() {
        let mapping = LabelSpaceMapping::analyze(
            &taxonomy(&["a"]),
            &taxonomy(&["a", "b", "c"]),
        );
        let (unexpected, undeclared) = mapping.compare_declared(&["b".to_string(), "x".to_string()]);
        assert_eq!(unexpected, vec!["x"]);
        assert_eq!(undeclared, vec!["c"]);
    }
}
