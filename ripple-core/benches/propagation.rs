//! Propagation benchmarks: a write travelling down a chain of derivations,
//! and a write fanning out to many effects.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ripple_core::{Derivation, EffectDeps, Runtime};

fn chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");

    for depth in [10usize, 100, 500] {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let source = scope.cell(0u64).unwrap();

        let first = {
            let source = source.clone();
            scope
                .derive(&[&source], move || Ok(source.read()? + 1))
                .unwrap()
        };
        let mut last: Derivation<u64> = first;
        for _ in 1..depth {
            let prev = last.clone();
            last = scope
                .derive(&[&prev], move || Ok(prev.get()? + 1))
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                source.update(|v| v + 1).unwrap();
                black_box(last.get().unwrap())
            })
        });
    }

    group.finish();
}

fn fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for width in [10usize, 100, 1000] {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let source = scope.cell(0u64).unwrap();

        for _ in 0..width {
            let source = source.clone();
            scope
                .effect(EffectDeps::on(&[&source]), move || {
                    black_box(source.peek().ok());
                    None
                })
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| source.update(|v| v + 1).unwrap())
        });
    }

    group.finish();
}

fn batched_writes(c: &mut Criterion) {
    let runtime = Runtime::new();
    let scope = runtime.create_scope();
    let cells: Vec<_> = (0..100u64).map(|i| scope.cell(i).unwrap()).collect();
    let sum = {
        let deps: Vec<&dyn ripple_core::Trackable> =
            cells.iter().map(|c| c as &dyn ripple_core::Trackable).collect();
        let cells = cells.clone();
        scope
            .derive(&deps, move || {
                cells.iter().map(|c| c.read()).sum::<Result<u64, _>>().map_err(Into::into)
            })
            .unwrap()
    };

    c.bench_function("batch_100_writes", |b| {
        b.iter(|| {
            runtime
                .batch(|| {
                    for cell in &cells {
                        cell.update(|v| v + 1).unwrap();
                    }
                })
                .unwrap();
            black_box(sum.get().unwrap())
        })
    });
}

criterion_group!(benches, chain, fan_out, batched_writes);
criterion_main!(benches);
