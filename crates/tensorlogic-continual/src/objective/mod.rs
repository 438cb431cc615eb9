//! Per-batch loss hook handed to the training engine.
//!
//! The engine computes the ground-truth loss and raw model outputs; an
//! [`Objective`] decides what is added on top. Regular training uses
//! [`GroundTruthObjective`]; distillation uses
//! [`DistillationObjective`](distill::DistillationObjective).

pub mod augment;
pub mod batch;
pub mod distill;
pub mod pseudo;

pub use augment::{ColorJitter, GaussianNoise, ImageAugmenter, StrongPhotometric};
pub use batch::{Batch, BoxXyxy, LossBreakdown, ModelOutput, Target};
pub use distill::{softmax_with_temperature, DistillTerms, DistillationObjective, TeacherAlignment};
pub use pseudo::{box_iou, non_max_suppression, Detection, PseudoLabeler};

use crate::ContinualResult;
use scirs2_core::random::StdRng;

/// Loss hook invoked by the engine for every batch.
///
/// Call order per batch: [`prepare_views`](Objective::prepare_views) before
/// the forward passes, [`augment_targets`](Objective::augment_targets) once
/// the teacher output is known, then [`compose`](Objective::compose) with the
/// ground-truth loss computed on the (possibly augmented) targets.
pub trait Objective: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Whether the engine must run a teacher forward pass.
    fn requires_teacher(&self) -> bool {
        false
    }

    /// Adjust the inputs before any forward pass.
    fn prepare_views(&self, _batch: &mut Batch, _rng: &mut StdRng) -> ContinualResult<()> {
        Ok(())
    }

    /// Add targets derived from the teacher; returns how many were added.
    fn augment_targets(
        &self,
        _batch: &mut Batch,
        _teacher: Option<&ModelOutput>,
    ) -> ContinualResult<usize> {
        Ok(0)
    }

    /// Combine the ground-truth loss with any additional terms.
    fn compose(
        &self,
        gt_loss: f64,
        student: &ModelOutput,
        teacher: Option<&ModelOutput>,
        batch: &Batch,
    ) -> ContinualResult<LossBreakdown>;
}

/// Identity objective: the loss is the ground-truth loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroundTruthObjective;

impl Objective for GroundTruthObjective {
    fn name(&self) -> &str {
        "ground_truth"
    }

    fn compose(
        &self,
        gt_loss: f64,
        _student: &ModelOutput,
        _teacher: Option<&ModelOutput>,
        _batch: &Batch,
    ) -> ContinualResult<LossBreakdown> {
        Ok(LossBreakdown::ground_truth(gt_loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::array;
    use scirs2_core::ndarray::Array2;
    use scirs2_core::random::SeedableRng;

    #[test]
    fn test_ground_truth_is_identity() {
        let objective = GroundTruthObjective;
        let mut batch = Batch::new(Array2::from_elem((2, 3), 0.3));
        let mut rng = StdRng::seed_from_u64(0);

        objective.prepare_views(&mut batch, &mut rng).unwrap();
        assert!(batch.weak_images.is_none());
        assert_eq!(objective.augment_targets(&mut batch, None).unwrap(), 0);

        let out = ModelOutput::from_logits(array![[1.0, 2.0], [0.0, 1.0]]);
        let loss = objective.compose(0.42, &out, None, &batch).unwrap();
        assert_eq!(loss, LossBreakdown::ground_truth(0.42));
        assert!(!objective.requires_teacher());
    }
}
