//! Batch and model-output containers exchanged with the loss hook.

use scirs2_core::ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned box, `[x1, y1, x2, y2]`.
pub type BoxXyxy = [f64; 4];

/// One ground-truth or pseudo-labeled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Index of the sample within the batch.
    pub sample: usize,
    /// Class id in the student's class space.
    pub class_id: usize,
    /// Box in pixel coordinates (unused for classification).
    pub bbox: BoxXyxy,
    /// Produced by the teacher rather than annotated.
    pub pseudo: bool,
}

/// A training batch as seen by the loss hook.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Student input, one flattened image per row with values in `[0, 1]`.
    pub images: Array2<f64>,
    /// Unaugmented copy for the teacher, present in consistency mode.
    pub weak_images: Option<Array2<f64>>,
    /// Objects in the batch.
    pub targets: Vec<Target>,
    /// Ground-truth class assigned to each prediction row, if any.
    pub row_classes: Vec<Option<usize>>,
    /// Whether each sample was drawn from the replay buffer.
    pub is_replay: Vec<bool>,
}

impl Batch {
    /// Create a batch with no targets and no replayed samples.
    pub fn new(images: Array2<f64>) -> Self {
        let size = images.nrows();
        Self {
            images,
            weak_images: None,
            targets: Vec::new(),
            row_classes: Vec::new(),
            is_replay: vec![false; size],
        }
    }

    /// Number of samples.
    pub fn size(&self) -> usize {
        self.images.nrows()
    }

    /// Input the teacher should see.
    pub fn teacher_view(&self) -> &Array2<f64> {
        self.weak_images.as_ref().unwrap_or(&self.images)
    }

    /// Whether sample `index` is a replayed old sample.
    pub fn sample_is_replay(&self, index: usize) -> bool {
        self.is_replay.get(index).copied().unwrap_or(false)
    }

    /// Fraction of samples drawn from the replay buffer.
    pub fn replay_fraction(&self) -> f64 {
        if self.is_replay.is_empty() {
            return 0.0;
        }
        self.is_replay.iter().filter(|r| **r).count() as f64 / self.is_replay.len() as f64
    }

    /// Number of pseudo-labeled targets.
    pub fn num_pseudo_targets(&self) -> usize {
        self.targets.iter().filter(|t| t.pseudo).count()
    }
}

/// Raw model predictions for one batch.
///
/// Rows of `class_logits` are prediction locations (anchors for detection,
/// samples for classification); `row_sample` maps each row to its sample.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Class logits, `rows x classes`.
    pub class_logits: Array2<f64>,
    /// Sample index of each row.
    pub row_sample: Vec<usize>,
    /// Decoded boxes per row, `rows x 4` in xyxy order.
    pub boxes: Option<Array2<f64>>,
    /// Intermediate feature maps, one per layer.
    pub features: Vec<Array2<f64>>,
    /// Mask prototype logits (segmentation).
    pub mask_protos: Option<Array2<f64>>,
}

impl ModelOutput {
    /// Classification-only output where row `i` belongs to sample `i`.
    pub fn from_logits(class_logits: Array2<f64>) -> Self {
        let rows = class_logits.nrows();
        Self {
            class_logits,
            row_sample: (0..rows).collect(),
            boxes: None,
            features: Vec::new(),
            mask_protos: None,
        }
    }

    /// Number of prediction rows.
    pub fn num_rows(&self) -> usize {
        self.class_logits.nrows()
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.class_logits.ncols()
    }
}

/// Per-term loss values of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// Final loss handed back to the engine.
    pub total: f64,
    /// Ground-truth loss computed by the engine.
    pub gt: f64,
    /// Classification distillation term (unweighted).
    pub cls: f64,
    /// Box regression distillation term (unweighted).
    pub reg: f64,
    /// Feature distillation term (unweighted).
    pub feat: f64,
    /// Mask distillation term (unweighted).
    pub mask: f64,
}

impl LossBreakdown {
    /// Breakdown for a loss that is ground truth only.
    pub fn ground_truth(gt: f64) -> Self {
        Self {
            total: gt,
            gt,
            ..Default::default()
        }
    }

    /// Distillation share of the total.
    pub fn distill_total(&self) -> f64 {
        self.total - self.gt
    }

    /// Named values for epoch reports.
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        [
            ("loss/total", self.total),
            ("loss/gt", self.gt),
            ("loss/distill_cls", self.cls),
            ("loss/distill_reg", self.reg),
            ("loss/distill_feat", self.feat),
            ("loss/distill_mask", self.mask),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}
