//! Reconciling the label spaces of an old and a new dataset.

pub mod adapt;
pub mod dataset;
pub mod descriptor;
pub mod mapping;
pub mod materialize;
pub mod replay;

// Re-export descriptor types
pub use descriptor::{ClassNames, DatasetDescriptor, Split, Taxonomy};

// Re-export mapping and adaptation
pub use adapt::{adapt_model, HeadAdaptation};
pub use mapping::LabelSpaceMapping;

// Re-export dataset view types
pub use dataset::{
    build_mixed_dataset, remap_label_content, DatasetView, MixOptions, Provenance, SampleRef,
};
pub use materialize::{materializer_for, CopyOnly, Materializer, SymlinkOrCopy};

// Re-export replay types
pub use replay::{ReplayBuffer, ReplaySample, ReplaySlot};

use scirs2_core::random::{Rng, StdRng};

/// `k` distinct indices drawn uniformly from `0..n`, returned sorted.
///
/// Partial Fisher-Yates shuffle; `k` is clamped to `n`.
pub fn sample_indices(n: usize, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let k = k.min(n);
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices.sort_unstable();
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::random::SeedableRng;

    #[test]
    fn test_sample_indices_distinct_and_bounded() {
        let mut rng = StdRng::seed_from_u64(9);
        let picked = sample_indices(20, 7, &mut rng);
        assert_eq!(picked.len(), 7);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert!(picked.iter().all(|&i| i < 20));

        assert_eq!(sample_indices(3, 10, &mut rng), vec![0, 1, 2]);
        assert!(sample_indices(0, 2, &mut rng).is_empty());
    }

    #[test]
    fn test_sample_indices_seeded() {
        let a = sample_indices(100, 10, &mut StdRng::seed_from_u64(4));
        let b = sample_indices(100, 10, &mut StdRng::seed_from_u64(4));
        assert_eq!(a, b);
    }
}
