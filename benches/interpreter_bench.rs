//! Benchmarks for the trampoline interpreter.
//!
//! Measures node dispatch cost on pure chains, deep flat_map spines, and
//! suspend-heavy programs.

use criterion::{criterion_group, criterion_main, Criterion};
use filament::{Effect, EffectRuntime};
use std::hint::black_box;

fn benchmark_pure_chains(criterion: &mut Criterion) {
    let runtime = EffectRuntime::create();
    let mut group = criterion.benchmark_group("pure_chain");

    group.bench_function("map_10", |bencher| {
        bencher.iter(|| {
            let mut effect = Effect::<String, i64>::succeed(black_box(1));
            for _ in 0..10 {
                effect = effect.map(|x| x + 1);
            }
            black_box(runtime.run(effect).unwrap())
        });
    });

    group.bench_function("flat_map_10", |bencher| {
        bencher.iter(|| {
            let mut effect = Effect::<String, i64>::succeed(black_box(1));
            for _ in 0..10 {
                effect = effect.flat_map(|x| Effect::succeed(x + 1));
            }
            black_box(runtime.run(effect).unwrap())
        });
    });

    group.finish();
}

fn benchmark_deep_spines(criterion: &mut Criterion) {
    let runtime = EffectRuntime::create();
    let mut group = criterion.benchmark_group("deep_spine");
    group.sample_size(20);

    for depth in [1_000_u64, 10_000, 100_000] {
        group.bench_function(format!("flat_map_{depth}"), |bencher| {
            bencher.iter(|| {
                let mut effect = Effect::<String, u64>::succeed(0);
                for _ in 0..depth {
                    effect = effect.flat_map(|x| Effect::succeed(x + 1));
                }
                black_box(runtime.run(effect).unwrap())
            });
        });
    }

    group.finish();
}

fn benchmark_suspend_dispatch(criterion: &mut Criterion) {
    let runtime = EffectRuntime::create();
    let mut group = criterion.benchmark_group("suspend");

    group.bench_function("suspend_100", |bencher| {
        bencher.iter(|| {
            let mut effect = Effect::<String, u64>::suspend(|| Ok(0));
            for _ in 0..100 {
                effect = effect.flat_map(|x| Effect::suspend(move || Ok(x + 1)));
            }
            black_box(runtime.run(effect).unwrap())
        });
    });

    group.bench_function("recovery_100", |bencher| {
        bencher.iter(|| {
            let mut effect = Effect::<u64, ()>::fail(0);
            for _ in 0..100 {
                effect = effect.catch_all(|error| Effect::fail(error + 1));
            }
            black_box(runtime.run(effect).unwrap_err())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_pure_chains,
    benchmark_deep_spines,
    benchmark_suspend_dispatch
);
criterion_main!(benches);
