//! Benchmarks for the gradient pass.
//!
//! Run with: cargo bench -p fv-cache-rs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fv_cache_rs::prelude::*;
use fv_cache_rs::ExampleIndex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const BLOCK: usize = 31;
const NUM_BLOCKS: usize = 8;

fn build_problem(num_examples: i32) -> (FeatureVectorCache, ExampleIndex, Model) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let config = CacheConfig::default()
        .with_max_num_fv(num_examples as usize * 8)
        .with_max_fv_dim(BLOCK * 3)
        .with_max_num_blocks(3);
    let mut cache = FeatureVectorCache::new(config).expect("cache");

    for id in 1..=num_examples {
        for x in 0..8 {
            let labels: Vec<i32> = (0..3).map(|_| rng.random_range(0..NUM_BLOCKS as i32)).collect();
            let feat: Vec<f32> = (0..BLOCK * 3).map(|_| rng.random_range(-1.0..1.0)).collect();
            let fv = NewFeatureVector::new([id, x, 0, 0], &labels, &feat)
                .with_belief(x == 0)
                .with_loss(if x == 0 { 0.0 } else { 1.0 });
            cache.add(&fv).expect("capacity");
        }
    }
    let index = cache.build_index();

    let w = (0..NUM_BLOCKS)
        .map(|_| (0..BLOCK).map(|_| rng.random_range(-0.1..0.1)).collect())
        .collect();
    let model = Model::new(ModelParams::new(w, 0.01), 50).expect("model");
    (cache, index, model)
}

fn bench_gradient(c: &mut Criterion) {
    let (cache, index, model) = build_problem(2_000);
    let w = model.flat();
    let mut group = c.benchmark_group("gradient");

    for threads in [1, 2, 4] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            let mut engine = ObjectiveEngine::new(
                EngineConfig::default()
                    .with_pruning(false)
                    .with_num_threads(threads),
            );
            let mut index = index.clone();
            let mut model = model.clone();
            b.iter(|| {
                black_box(
                    engine
                        .gradient(&mut index, &cache, &mut model, black_box(&w))
                        .expect("gradient"),
                )
            });
        });
    }
    group.finish();
}

fn bench_build_index(c: &mut Criterion) {
    c.bench_function("build_index_16k", |b| {
        b.iter_with_setup(
            || build_problem(2_000).0,
            |mut cache| black_box(cache.build_index()),
        );
    });
}

criterion_group!(benches, bench_gradient, bench_build_index);
criterion_main!(benches);
