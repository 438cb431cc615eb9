//! Benchmark distillation objective composition.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use scirs2_core::ndarray::Array2;
use std::hint::black_box;
use tensorlogic_continual::{
    Batch, DistillationObjective, DistillationSettings, ModelOutput, Objective, ReplaySettings,
    TaskKind, TeacherAlignment,
};

fn generate_output(rows: usize, classes: usize, phase: f64) -> ModelOutput {
    let class_logits =
        Array2::from_shape_fn((rows, classes), |(i, j)| ((i + j) as f64 * 0.1 + phase).sin() * 3.0);
    let boxes = Array2::from_shape_fn((rows, 4), |(i, j)| {
        let base = (i % 32) as f64 * 10.0 + phase;
        if j < 2 {
            base
        } else {
            base + 20.0
        }
    });
    ModelOutput {
        class_logits,
        row_sample: (0..rows).map(|r| r % 8).collect(),
        boxes: Some(boxes),
        features: vec![
            Array2::from_shape_fn((64, 64), |(i, j)| ((i * j) as f64 * 0.01 + phase).cos()),
            Array2::from_shape_fn((32, 32), |(i, j)| ((i + j) as f64 * 0.02 + phase).cos()),
        ],
        mask_protos: Some(Array2::from_shape_fn((32, 160), |(i, j)| {
            ((i + 2 * j) as f64 * 0.05 + phase).sin()
        })),
    }
}

fn objective(task: TaskKind, old_classes: usize, new_classes: usize) -> DistillationObjective {
    let settings = DistillationSettings {
        teacher_model_path: Some("teacher.json".into()),
        ..Default::default()
    };
    let replay = ReplaySettings {
        ratio: 0.25,
        distill_boost: 2.0,
        ..Default::default()
    };
    DistillationObjective::new(
        &settings,
        &replay,
        task,
        TeacherAlignment::prefix(old_classes),
        old_classes..old_classes + new_classes,
    )
    .unwrap()
}

fn benchmark_compose_by_task(c: &mut Criterion) {
    let mut group = c.benchmark_group("compose_by_task");

    let student = generate_output(1000, 12, 0.0);
    let teacher = generate_output(1000, 10, 0.3);
    let mut batch = Batch::new(Array2::from_elem((8, 16), 0.5));
    batch.is_replay = vec![true, true, false, false, false, false, false, false];

    for task in [TaskKind::Classify, TaskKind::Detect, TaskKind::Segment] {
        let objective = objective(task, 10, 2);
        group.bench_with_input(BenchmarkId::from_parameter(task), &task, |b, _| {
            b.iter(|| {
                let loss = objective
                    .compose(black_box(1.0), &student, Some(&teacher), &batch)
                    .unwrap();
                black_box(loss);
            });
        });
    }

    group.finish();
}

fn benchmark_compose_row_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("compose_row_scaling");

    for rows in [100, 1000, 8400] {
        let student = generate_output(rows, 12, 0.0);
        let teacher = generate_output(rows, 10, 0.3);
        let batch = Batch::new(Array2::from_elem((8, 16), 0.5));
        let objective = objective(TaskKind::Detect, 10, 2);

        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| {
                let loss = objective
                    .compose(black_box(1.0), &student, Some(&teacher), &batch)
                    .unwrap();
                black_box(loss);
            });
        });
    }

    group.finish();
}

fn benchmark_pseudo_labels(c: &mut Criterion) {
    let mut group = c.benchmark_group("pseudo_labels");

    let teacher = generate_output(2000, 10, 0.3);
    let objective = objective(TaskKind::Detect, 10, 2);

    group.bench_function("augment_targets", |b| {
        b.iter(|| {
            let mut batch = Batch::new(Array2::from_elem((8, 16), 0.5));
            let added = objective.augment_targets(&mut batch, Some(&teacher)).unwrap();
            black_box(added);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_compose_by_task,
    benchmark_compose_row_scaling,
    benchmark_pseudo_labels,
);
criterion_main!(benches);
