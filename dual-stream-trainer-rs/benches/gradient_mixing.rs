//! Gradient mixing benchmarks.
//!
//! Benchmarks the per-iteration gradient work: flattening a detector-sized
//! parameter store, mixing base and novel gradients, and writing the result
//! back.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dual_stream_trainer_rs::gradient::{self, GradientLayout};
use dual_stream_trainer_rs::mixer::GradientMixer;
use dual_stream_trainer_rs::ParameterStore;

/// Builds a store of `layers` conv-like parameters with gradients attached.
fn create_store(layers: usize, width: usize) -> ParameterStore {
    let mut store = ParameterStore::new();
    for layer in 0..layers {
        let numel = width * width;
        store
            .insert_named(
                format!("backbone.res{layer}.conv.weight"),
                vec![width, width],
                vec![0.01; numel],
            )
            .unwrap();
        let grad: Vec<f32> = (0..numel).map(|i| ((i + layer) as f32 * 0.37).sin()).collect();
        store
            .accumulate_grad(&format!("backbone.res{layer}.conv.weight"), &grad)
            .unwrap();
        store
            .insert_named(format!("backbone.res{layer}.bn.running_mean"), vec![width], vec![0.0; width])
            .unwrap();
    }
    store
}

fn benchmark_flatten(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatten");
    for width in [64, 256] {
        let store = create_store(16, width);
        let layout = GradientLayout::from_store(&store);
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| black_box(gradient::flatten(&layout, black_box(&store)).unwrap()))
        });
    }
    group.finish();
}

fn benchmark_mix(c: &mut Criterion) {
    let store = create_store(16, 256);
    let layout = GradientLayout::from_store(&store);
    let base = gradient::flatten(&layout, &store).unwrap();
    let novel = base.scaled_add(-0.5, &base).unwrap();
    let mixer = GradientMixer::new();

    c.bench_function("mix_1m", |b| {
        b.iter(|| black_box(mixer.mix(black_box(&base), black_box(&novel), 0.8, 0).unwrap()))
    });
}

fn benchmark_assign(c: &mut Criterion) {
    let mut store = create_store(16, 256);
    let layout = GradientLayout::from_store(&store);
    let mixed = gradient::flatten(&layout, &store).unwrap();

    c.bench_function("assign_1m", |b| {
        b.iter(|| gradient::assign(&layout, black_box(&mut store), black_box(&mixed)).unwrap())
    });
}

criterion_group!(
    mixing_benches,
    benchmark_flatten,
    benchmark_mix,
    benchmark_assign,
);
criterion_main!(mixing_benches);
