//! Teacher/student distillation objective.
//!
//! Adds weighted retention terms to the engine's ground-truth loss:
//! - `cls`: temperature-scaled KL between teacher and student class
//!   distributions, computed over the old classes the two models share
//! - `reg`: `1 - IoU` between student and teacher boxes on foreground rows
//! - `feat`: mean squared error between intermediate feature maps
//! - `mask`: BCE between student mask prototypes and the teacher's
//!
//! Rows whose ground-truth class is new are never distilled, since the
//! teacher has no knowledge of them.

use crate::config::{DistillationSettings, ReplaySettings, TaskKind};
use crate::objective::augment::{ImageAugmenter, StrongPhotometric};
use crate::objective::batch::{Batch, LossBreakdown, ModelOutput};
use crate::objective::pseudo::{box_iou, PseudoLabeler};
use crate::objective::Objective;
use crate::{ContinualError, ContinualResult};
use scirs2_core::ndarray::{Array2, ArrayView1};
use scirs2_core::random::StdRng;
use std::collections::{BTreeMap, HashSet};

/// Which distillation terms a task kind supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistillTerms {
    /// Classification KL.
    pub cls: bool,
    /// Box regression.
    pub reg: bool,
    /// Feature matching.
    pub feat: bool,
    /// Mask prototypes.
    pub mask: bool,
}

impl DistillTerms {
    /// Terms enabled for a task kind.
    pub fn for_task(task: TaskKind) -> Self {
        match task {
            TaskKind::Classify => Self {
                cls: true,
                reg: false,
                feat: false,
                mask: false,
            },
            TaskKind::Detect => Self {
                cls: true,
                reg: true,
                feat: true,
                mask: false,
            },
            TaskKind::Segment => Self {
                cls: true,
                reg: true,
                feat: true,
                mask: true,
            },
        }
    }
}

/// Column correspondence between teacher and student class spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherAlignment {
    pairs: Vec<(usize, usize)>,
}

impl TeacherAlignment {
    /// Match columns by class name; teacher classes the student lacks are dropped.
    pub fn by_name(teacher_names: &[String], student_names: &[String]) -> Self {
        let pairs = teacher_names
            .iter()
            .enumerate()
            .filter_map(|(t, name)| {
                student_names
                    .iter()
                    .position(|s| s == name)
                    .map(|s| (t, s))
            })
            .collect();
        Self { pairs }
    }

    /// Teacher column `i` maps to student column `i` for `i < num_old`.
    pub fn prefix(num_old: usize) -> Self {
        Self {
            pairs: (0..num_old).map(|i| (i, i)).collect(),
        }
    }

    /// `(teacher_column, student_column)` pairs.
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Number of shared classes.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no class is shared.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Student column of a teacher column.
    pub fn student_column(&self, teacher_col: usize) -> Option<usize> {
        self.pairs
            .iter()
            .find(|(t, _)| *t == teacher_col)
            .map(|(_, s)| *s)
    }

    /// Teacher logits laid out in the student's class space, zeros elsewhere.
    pub fn align(&self, teacher_logits: &Array2<f64>, student_width: usize) -> Array2<f64> {
        let mut aligned = Array2::zeros((teacher_logits.nrows(), student_width));
        for &(t, s) in &self.pairs {
            if t < teacher_logits.ncols() && s < student_width {
                aligned.column_mut(s).assign(&teacher_logits.column(t));
            }
        }
        aligned
    }
}

/// Softmax of `logits / temperature`.
pub fn softmax_with_temperature(logits: &ArrayView1<f64>, temperature: f64) -> Vec<f64> {
    softmax_slice(logits.iter().copied(), temperature)
}

fn softmax_slice(logits: impl Iterator<Item = f64>, temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.map(|x| x / temperature).collect();
    let max_val = scaled.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let exp_vals: Vec<f64> = scaled.iter().map(|&x| (x - max_val).exp()).collect();
    let sum: f64 = exp_vals.iter().sum();
    exp_vals.iter().map(|&x| x / sum).collect()
}

/// `KL(teacher || student)` of two probability vectors.
fn kl_divergence(teacher: &[f64], student: &[f64]) -> f64 {
    teacher
        .iter()
        .zip(student)
        .filter(|(t, _)| **t > 1e-12)
        .map(|(t, s)| t * (t / s.max(1e-12)).ln())
        .sum()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable binary cross-entropy on a logit.
fn bce_with_logits(logit: f64, target: f64) -> f64 {
    logit.max(0.0) - logit * target + (1.0 + (-logit.abs()).exp()).ln()
}

/// Distillation objective composing retention terms onto the ground-truth loss.
pub struct DistillationObjective {
    settings: DistillationSettings,
    replay_boost: f64,
    terms: DistillTerms,
    alignment: TeacherAlignment,
    new_class_ids: HashSet<usize>,
    class_weights: BTreeMap<usize, f64>,
    pseudo: Option<PseudoLabeler>,
    strong_view: StrongPhotometric,
}

impl DistillationObjective {
    /// Create an objective for `task`.
    ///
    /// # Arguments
    /// * `alignment` - teacher column to student column correspondence
    /// * `new_class_ids` - student class ids the teacher never saw
    pub fn new(
        settings: &DistillationSettings,
        replay: &ReplaySettings,
        task: TaskKind,
        alignment: TeacherAlignment,
        new_class_ids: impl IntoIterator<Item = usize>,
    ) -> ContinualResult<Self> {
        if settings.temperature <= 0.0 {
            return Err(ContinualError::ConfigError(
                "Temperature must be positive".to_string(),
            ));
        }
        let pseudo = (task == TaskKind::Detect && settings.pseudo_labels_enabled()).then(|| {
            PseudoLabeler::new(settings.pseudo_conf_threshold, settings.pseudo_iou_threshold)
        });

        Ok(Self {
            class_weights: settings.class_weights.clone(),
            settings: settings.clone(),
            replay_boost: replay.distill_boost,
            terms: DistillTerms::for_task(task),
            alignment,
            new_class_ids: new_class_ids.into_iter().collect(),
            pseudo,
            strong_view: StrongPhotometric::default(),
        })
    }

    /// Terms this objective computes.
    pub fn terms(&self) -> DistillTerms {
        self.terms
    }

    /// Teacher/student column correspondence.
    pub fn alignment(&self) -> &TeacherAlignment {
        &self.alignment
    }

    fn row_boost(&self, batch: &Batch, sample: usize, factor: f64) -> f64 {
        if batch.sample_is_replay(sample) {
            self.replay_boost * factor
        } else {
            1.0
        }
    }

    fn distillable(&self, batch: &Batch, row: usize) -> bool {
        match batch.row_classes.get(row).copied().flatten() {
            Some(class_id) => !self.new_class_ids.contains(&class_id),
            None => true,
        }
    }

    /// Foreground flags per row: teacher max probability above the threshold.
    fn foreground_rows(&self, teacher: &ModelOutput) -> Vec<bool> {
        teacher
            .class_logits
            .rows()
            .into_iter()
            .map(|row| {
                softmax_with_temperature(&row, 1.0)
                    .into_iter()
                    .fold(0.0, f64::max)
                    > self.settings.teacher_conf_threshold
            })
            .collect()
    }

    fn classification_term(
        &self,
        student: &ModelOutput,
        teacher: &ModelOutput,
        batch: &Batch,
        foreground: &[bool],
    ) -> ContinualResult<f64> {
        if student.num_rows() != teacher.num_rows() {
            return Err(ContinualError::LossError(format!(
                "Student and teacher row counts differ: {} vs {}",
                student.num_rows(),
                teacher.num_rows()
            )));
        }
        if self.alignment.is_empty() {
            return Ok(0.0);
        }

        let t = self.settings.temperature;
        let (t_cols, s_cols): (Vec<usize>, Vec<usize>) =
            self.alignment.pairs().iter().copied().unzip();
        if let Some(&bad) = s_cols.iter().find(|&&c| c >= student.num_classes()) {
            return Err(ContinualError::LossError(format!(
                "Aligned student column {} outside {} classes",
                bad,
                student.num_classes()
            )));
        }

        let (mut fg_sum, mut fg_n, mut bg_sum, mut bg_n) = (0.0, 0usize, 0.0, 0usize);
        for row in 0..student.num_rows() {
            if !self.distillable(batch, row) {
                continue;
            }
            let s_row = student.class_logits.row(row);
            let t_row = teacher.class_logits.row(row);
            let kl = kl_divergence(
                &softmax_slice(t_cols.iter().map(|&c| t_row[c]), t),
                &softmax_slice(s_cols.iter().map(|&c| s_row[c]), t),
            );
            let sample = student.row_sample.get(row).copied().unwrap_or(row);

            if foreground.get(row).copied().unwrap_or(false) {
                let teacher_argmax = t_row
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0;
                let class_weight = self
                    .alignment
                    .student_column(teacher_argmax)
                    .and_then(|c| self.class_weights.get(&c).copied())
                    .unwrap_or(1.0);
                fg_sum += kl * class_weight * self.row_boost(batch, sample, 1.0);
                fg_n += 1;
            } else {
                bg_sum += kl * self.row_boost(batch, sample, 0.5);
                bg_n += 1;
            }
        }

        let loss_fg = if fg_n > 0 { fg_sum / fg_n as f64 } else { 0.0 };
        let loss_bg = if bg_n > 0 { bg_sum / bg_n as f64 } else { 0.0 };
        Ok((loss_fg + self.settings.bg_weight * loss_bg) * t * t)
    }

    fn regression_term(
        &self,
        student: &ModelOutput,
        teacher: &ModelOutput,
        batch: &Batch,
        foreground: &[bool],
    ) -> ContinualResult<f64> {
        let (Some(s_boxes), Some(t_boxes)) = (student.boxes.as_ref(), teacher.boxes.as_ref()) else {
            return Ok(0.0);
        };
        if s_boxes.shape() != t_boxes.shape() || s_boxes.ncols() != 4 {
            return Err(ContinualError::LossError(format!(
                "Box shape mismatch: {:?} vs {:?}",
                s_boxes.shape(),
                t_boxes.shape()
            )));
        }

        let mut sum = 0.0;
        let mut n = 0usize;
        for row in 0..s_boxes.nrows() {
            if !foreground.get(row).copied().unwrap_or(false) || !self.distillable(batch, row) {
                continue;
            }
            let s = s_boxes.row(row);
            let t = t_boxes.row(row);
            let iou = box_iou(&[s[0], s[1], s[2], s[3]], &[t[0], t[1], t[2], t[3]]);
            let sample = student.row_sample.get(row).copied().unwrap_or(row);
            sum += (1.0 - iou) * self.row_boost(batch, sample, 1.0);
            n += 1;
        }
        Ok(if n > 0 { sum / n as f64 } else { 0.0 })
    }

    fn feature_term(&self, student: &ModelOutput, teacher: &ModelOutput) -> ContinualResult<f64> {
        let mut total = 0.0;
        for (i, (s, t)) in student.features.iter().zip(&teacher.features).enumerate() {
            if s.shape() != t.shape() {
                return Err(ContinualError::LossError(format!(
                    "Feature layer {} shape mismatch: {:?} vs {:?}",
                    i,
                    s.shape(),
                    t.shape()
                )));
            }
            if s.is_empty() {
                continue;
            }
            let sq: f64 = s.iter().zip(t.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
            total += sq / s.len() as f64;
        }
        Ok(total)
    }

    fn mask_term(&self, student: &ModelOutput, teacher: &ModelOutput) -> ContinualResult<f64> {
        let (Some(s), Some(t)) = (student.mask_protos.as_ref(), teacher.mask_protos.as_ref()) else {
            return Ok(0.0);
        };
        if s.shape() != t.shape() {
            return Err(ContinualError::LossError(format!(
                "Mask prototype shape mismatch: {:?} vs {:?}",
                s.shape(),
                t.shape()
            )));
        }
        if s.is_empty() {
            return Ok(0.0);
        }
        let sum: f64 = s
            .iter()
            .zip(t.iter())
            .map(|(&logit, &t_logit)| bce_with_logits(logit, sigmoid(t_logit)))
            .sum();
        Ok(sum / s.len() as f64)
    }
}

impl Objective for DistillationObjective {
    fn name(&self) -> &str {
        "distillation"
    }

    fn requires_teacher(&self) -> bool {
        true
    }

    fn prepare_views(&self, batch: &mut Batch, rng: &mut StdRng) -> ContinualResult<()> {
        if self.settings.enable_consistency {
            let strong = self.strong_view.augment(&batch.images.view(), rng)?;
            batch.weak_images = Some(std::mem::replace(&mut batch.images, strong));
        }
        Ok(())
    }

    fn augment_targets(
        &self,
        batch: &mut Batch,
        teacher: Option<&ModelOutput>,
    ) -> ContinualResult<usize> {
        let (Some(labeler), Some(teacher)) = (self.pseudo.as_ref(), teacher) else {
            return Ok(0);
        };
        let pseudo = labeler.generate(teacher, &self.alignment);
        let added = pseudo.len();
        batch.targets.extend(pseudo);
        Ok(added)
    }

    fn compose(
        &self,
        gt_loss: f64,
        student: &ModelOutput,
        teacher: Option<&ModelOutput>,
        batch: &Batch,
    ) -> ContinualResult<LossBreakdown> {
        let teacher = teacher.ok_or_else(|| {
            ContinualError::LossError("distillation requires teacher output".to_string())
        })?;
        let s = &self.settings;
        let foreground = self.foreground_rows(teacher);
        let global = 1.0 + (self.replay_boost - 1.0) * batch.replay_fraction();

        let cls = if self.terms.cls && s.cls_weight > 0.0 {
            self.classification_term(student, teacher, batch, &foreground)?
        } else {
            0.0
        };
        let reg = if self.terms.reg && s.reg_weight > 0.0 {
            self.regression_term(student, teacher, batch, &foreground)?
        } else {
            0.0
        };
        let feat = if self.terms.feat && s.feat_weight > 0.0 {
            self.feature_term(student, teacher)? * global
        } else {
            0.0
        };
        let mask = if self.terms.mask && s.mask_weight > 0.0 {
            self.mask_term(student, teacher)? * global
        } else {
            0.0
        };

        let consistency = if s.enable_consistency {
            s.consistency_weight
        } else {
            1.0
        };
        let distill = (s.cls_weight * cls + s.reg_weight * reg + s.feat_weight * feat
            + s.mask_weight * mask)
            * consistency;

        Ok(LossBreakdown {
            total: gt_loss + distill,
            gt: gt_loss,
            cls,
            reg,
            feat,
            mask,
        })
    }
}
