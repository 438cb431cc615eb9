//! Property-based tests for label reconciliation, sampling and scheduling.

use proptest::prelude::*;
use scirs2_core::ndarray::Array1;
use scirs2_core::random::{SeedableRng, StdRng};
use std::collections::HashSet;
use tensorlogic_continual::freeze::{CheckpointCompression, FreezeSettings, StageWeightStore};
use tensorlogic_continual::objective::softmax_with_temperature;
use tensorlogic_continual::reconcile::{sample_indices, ReplaySample};
use tensorlogic_continual::{
    FreezeScheduler, LabelSpaceMapping, ReplayBuffer, SequentialModel, Taxonomy,
};

fn names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-f]{1,3}", 0..8).prop_map(|s| s.into_iter().collect())
}

fn replay_samples(n: usize) -> Vec<ReplaySample> {
    (0..n)
        .map(|i| ReplaySample::Classification {
            image: format!("old/train/c/{}.jpg", i).into(),
            class_name: "c".to_string(),
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_combined_extends_old(old in names(), new in names()) {
        let mapping = LabelSpaceMapping::analyze(
            &Taxonomy::new(old.clone()).unwrap(),
            &Taxonomy::new(new.clone()).unwrap(),
        );
        let combined = &mapping.combined_names;

        prop_assert_eq!(&combined[..old.len()], old.as_slice());
        let unique: HashSet<&String> = combined.iter().collect();
        prop_assert_eq!(unique.len(), combined.len());

        for (i, name) in new.iter().enumerate() {
            let target = mapping.remap_class_id(i).unwrap();
            prop_assert_eq!(&combined[target], name);
            prop_assert_eq!(mapping.is_new_class(target), !old.contains(name));
        }
        prop_assert!(mapping.check_model_classes(&old).is_ok());
    }

    #[test]
    fn prop_sample_indices_distinct_sorted(n in 0usize..200, k in 0usize..250, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let picked = sample_indices(n, k, &mut rng);
        prop_assert_eq!(picked.len(), k.min(n));
        prop_assert!(picked.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(picked.iter().all(|&i| i < n));
    }

    #[test]
    fn prop_replay_buffer_capped(n in 0usize..300, max in 0usize..100, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let buffer = ReplayBuffer::from_samples(replay_samples(n), max, &mut rng);
        prop_assert_eq!(buffer.len(), n.min(max));
    }

    #[test]
    fn prop_replay_slots(n in 1usize..50, batch in 1usize..64, ratio in 0.0f64..=1.0, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let buffer = ReplayBuffer::from_samples(replay_samples(n), n, &mut rng);
        let slots = buffer.plan_batch(batch, ratio, &mut rng);

        prop_assert_eq!(slots.len(), (batch as f64 * ratio).floor() as usize);
        let distinct: HashSet<usize> = slots.iter().map(|s| s.slot).collect();
        prop_assert_eq!(distinct.len(), slots.len());
        prop_assert!(slots.iter().all(|s| s.slot < batch && s.sample < n));
    }

    #[test]
    fn prop_softmax_is_distribution(
        logits in prop::collection::vec(-20.0f64..20.0, 1..10),
        temperature in 0.1f64..10.0,
    ) {
        let p = softmax_with_temperature(&Array1::from(logits).view(), temperature);
        let sum: f64 = p.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-9);
        prop_assert!(p.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }

    #[test]
    fn prop_stage_index_never_increases(metrics in prop::collection::vec(0.01f64..10.0, 0..40)) {
        let dir = tempfile::tempdir().unwrap();
        let mut model = SequentialModel::new("head")
            .with_layer("model.0", 2, 2)
            .with_layer("model.1", 2, 2)
            .with_layer("model.2", 2, 2);
        let settings = FreezeSettings {
            patience: 2,
            min_epochs_per_stage: 1,
            auto_load_best: false,
            ..Default::default()
        };
        let store = StageWeightStore::new(dir.path(), CheckpointCompression::None);
        let stages = vec!["model.2".to_string(), "model.1".to_string(), "model.0".to_string()];
        let mut scheduler = FreezeScheduler::new(&mut model, stages, settings, store).unwrap();

        // None (done) ranks below every stage
        let rank = |s: Option<usize>| s.map_or(-1i64, |i| i as i64);
        let mut previous = rank(scheduler.current_stage());
        for metric in metrics {
            scheduler.step_epoch(metric, None, &mut model).unwrap();
            let current = rank(scheduler.current_stage());
            prop_assert!(current <= previous);
            prop_assert!(previous - current <= 1);
            previous = current;
        }
    }
}
