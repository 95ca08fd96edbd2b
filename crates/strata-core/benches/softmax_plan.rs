//! Benchmarks for plan construction versus cached execution

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use strata_core::{Engine, InstanceCache, Softmax};

const SHAPES: [[usize; 4]; 3] = [[1, 8, 8, 8], [8, 32, 16, 16], [32, 64, 8, 8]];

fn numel(dims: &[usize; 4]) -> usize {
    dims.iter().product()
}

/// Fresh instance + setup_forward every iteration
fn bench_cold_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("softmax_cold_plan");

    for dims in SHAPES {
        group.bench_with_input(BenchmarkId::new("f32", format!("{dims:?}")), &dims, |bencher, &dims| {
            let engine = Engine::new().unwrap();
            bencher.iter(|| {
                let mut op = Softmax::<f32>::rank4(&engine, dims, 1).unwrap();
                op.setup_forward().unwrap();
            });
        });
    }

    group.finish();
}

/// Forward on an instance looked up from the cache each iteration
fn bench_cached_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("softmax_cached_forward");

    for dims in SHAPES {
        let n = numel(&dims);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("f32", format!("{dims:?}")), &dims, |bencher, &dims| {
            let engine = Engine::new().unwrap();
            let cache = InstanceCache::<f32>::new(&engine);
            let mut src = engine.allocate::<f32>(n).unwrap();
            let dst = engine.allocate::<f32>(n).unwrap();
            let data: Vec<f32> = (0..n).map(|i| (i % 17) as f32 * 0.25).collect();
            src.copy_from_slice(&engine, &data).unwrap();
            cache.create_forward("bench", &src, &dst, dims, 1).unwrap();

            bencher.iter(|| {
                let op = cache.get_or_create("bench", dims, 1).unwrap();
                op.lock().forward().unwrap();
            });
        });
    }

    group.finish();
}

/// Forward + backward on a prepared instance
fn bench_forward_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("softmax_forward_backward");

    for dims in SHAPES {
        let n = numel(&dims);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("f32", format!("{dims:?}")), &dims, |bencher, &dims| {
            let engine = Engine::new().unwrap();
            let src = engine.allocate::<f32>(n).unwrap();
            let dst = engine.allocate::<f32>(n).unwrap();
            let diff_dst = engine.allocate::<f32>(n).unwrap();
            let diff_src = engine.allocate::<f32>(n).unwrap();

            let mut op = Softmax::<f32>::rank4(&engine, dims, 1).unwrap();
            op.setup_backward().unwrap();
            op.update_user_mem(&src, &dst);
            op.bind(strata_core::MemoryKind::DiffDst, &diff_dst);
            op.bind(strata_core::MemoryKind::DiffSrc, &diff_src);

            bencher.iter(|| {
                op.forward().unwrap();
                op.backward().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cold_plan, bench_cached_forward, bench_forward_backward);
criterion_main!(benches);
