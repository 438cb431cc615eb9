//! Stage plans for the freeze scheduler.

use crate::config::ModelSize;

/// Number of top-level blocks in the stock model layouts.
pub const DEFAULT_NUM_BLOCKS: usize = 10;

/// Default stage list for a model size.
///
/// Index 0 is the head-side block `model.9` and the last index is the input
/// stem `model.0`. The scheduler starts at the last index, so the stem is
/// trained alone first and head-side blocks join one at a time. Every stock
/// size shares the ten-block layout.
pub fn default_stage_plan(_size: ModelSize) -> Vec<String> {
    (0..DEFAULT_NUM_BLOCKS)
        .rev()
        .map(|block| format!("model.{}", block))
        .collect()
}

/// Explicit stages when configured, otherwise the default plan.
pub fn resolve_stage_plan(explicit: &[String], size: ModelSize) -> Vec<String> {
    if explicit.is_empty() {
        default_stage_plan(size)
    } else {
        explicit.to_vec()
    }
}
