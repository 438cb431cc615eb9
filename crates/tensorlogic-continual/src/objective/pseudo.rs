//! Teacher pseudo-labels for old classes.

use crate::objective::batch::{BoxXyxy, ModelOutput, Target};
use crate::objective::distill::{softmax_with_temperature, TeacherAlignment};
use std::collections::BTreeMap;

/// A scored box candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Sample index within the batch.
    pub sample: usize,
    /// Class id in the student's class space.
    pub class_id: usize,
    /// Box, xyxy.
    pub bbox: BoxXyxy,
    /// Teacher confidence.
    pub confidence: f64,
}

/// Intersection over union of two xyxy boxes.
pub fn box_iou(a: &BoxXyxy, b: &BoxXyxy) -> f64 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy non-maximum suppression within each `(sample, class)` group.
///
/// Output is ordered by sample, then class, then descending confidence.
pub fn non_max_suppression(candidates: Vec<Detection>, iou_threshold: f64) -> Vec<Detection> {
    let mut groups: BTreeMap<(usize, usize), Vec<Detection>> = BTreeMap::new();
    for det in candidates {
        groups.entry((det.sample, det.class_id)).or_default().push(det);
    }

    let mut kept = Vec::new();
    for (_, mut group) in groups {
        group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut selected: Vec<Detection> = Vec::new();
        for det in group {
            if selected
                .iter()
                .all(|s| box_iou(&s.bbox, &det.bbox) <= iou_threshold)
            {
                selected.push(det);
            }
        }
        kept.extend(selected);
    }
    kept
}

/// Turns confident teacher predictions on old classes into extra targets.
#[derive(Debug, Clone)]
pub struct PseudoLabeler {
    /// Minimum teacher probability.
    pub conf_threshold: f64,
    /// Suppression IoU.
    pub iou_threshold: f64,
}

impl PseudoLabeler {
    /// Create a labeler.
    pub fn new(conf_threshold: f64, iou_threshold: f64) -> Self {
        Self {
            conf_threshold,
            iou_threshold,
        }
    }

    /// Pseudo-label targets for a batch, in the student's class space.
    ///
    /// Outputs without boxes produce nothing.
    pub fn generate(&self, teacher: &ModelOutput, alignment: &TeacherAlignment) -> Vec<Target> {
        let Some(boxes) = teacher.boxes.as_ref() else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for (row, logits) in teacher.class_logits.rows().into_iter().enumerate() {
            let probs = softmax_with_temperature(&logits, 1.0);
            let sample = teacher.row_sample.get(row).copied().unwrap_or(row);
            let b = boxes.row(row);
            for &(teacher_col, student_col) in alignment.pairs() {
                let confidence = probs[teacher_col];
                if confidence >= self.conf_threshold {
                    candidates.push(Detection {
                        sample,
                        class_id: student_col,
                        bbox: [b[0], b[1], b[2], b[3]],
                        confidence,
                    });
                }
            }
        }

        non_max_suppression(candidates, self.iou_threshold)
            .into_iter()
            .map(|det| Target {
                sample: det.sample,
                class_id: det.class_id,
                bbox: det.bbox,
                pseudo: true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use scirs2_core::array;

    fn det(sample: usize, class_id: usize, bbox: BoxXyxy, confidence: f64) -> Detection {
        Detection {
            sample,
            class_id,
            bbox,
            confidence,
        }
    }

    #[test]
    fn test_box_iou() {
        let a = [0.0, 0.0, 2.0, 2.0];
        let b = [1.0, 1.0, 3.0, 3.0];
        assert_abs_diff_eq!(box_iou(&a, &b), 1.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(box_iou(&a, &a), 1.0, epsilon = 1e-12);
        assert_eq!(box_iou(&a, &[5.0, 5.0, 6.0, 6.0]), 0.0);
    }

    #[test]
    fn test_nms_suppresses_within_class_only() {
        let kept = non_max_suppression(
            vec![
                det(0, 0, [0.0, 0.0, 10.0, 10.0], 0.8),
                det(0, 0, [0.5, 0.5, 10.0, 10.0], 0.9),
                det(0, 1, [0.5, 0.5, 10.0, 10.0], 0.75),
                det(1, 0, [0.0, 0.0, 10.0, 10.0], 0.7),
            ],
            0.7,
        );
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
        assert_eq!(kept[2].sample, 1);
    }

    #[test]
    fn test_generate_old_classes_only() {
        // Teacher knows [a, b]; student is [a, b, c]. Row 0 is confident on b.
        let teacher = ModelOutput {
            class_logits: array![[0.0, 5.0], [0.1, 0.0]],
            row_sample: vec![0, 1],
            boxes: Some(array![[0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 2.0, 2.0]]),
            features: Vec::new(),
            mask_protos: None,
        };
        let alignment = TeacherAlignment::prefix(2);
        let targets = PseudoLabeler::new(0.7, 0.7).generate(&teacher, &alignment);

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].class_id, 1);
        assert_eq!(targets[0].sample, 0);
        assert!(targets[0].pseudo);
    }
}
