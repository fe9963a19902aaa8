//! Core array and autodiff benchmarks
//!
//! - Binary operations, contiguous and broadcast
//! - Unary operations
//! - Matrix multiplication
//! - Reductions
//! - Movement (strided read-back)
//! - A forward/backward training step under a disposal scope

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use kiln::{Context, DenseArray, EngineConfig, Host, RawTensor, ReduceMode, TensorOps};

fn ctx() -> Context<Host> {
    Context::host_with(EngineConfig::default().with_seed(0)).expect("host context")
}

/// Deterministic pseudo-random data of the given shape
fn array(ctx: &Context<Host>, dims: &[usize]) -> DenseArray<Host> {
    let size = dims.iter().product::<usize>();
    let data: Vec<f32> = (0..size).map(|i| (i as f32 * 0.01).sin()).collect();
    ctx.from_vec(data, dims).expect("bench array")
}

// ===== BINARY OPERATIONS =====

fn bench_binary_ops(c: &mut Criterion) {
    let ctx = ctx();
    let mut group = c.benchmark_group("binary_ops");

    for size in [1024, 16 * 1024, 256 * 1024] {
        let a = array(&ctx, &[size]);
        let b = array(&ctx, &[size]);
        group.bench_with_input(BenchmarkId::new("add", size), &size, |bench, _| {
            bench.iter(|| ctx.scoped(|_| black_box(&a).add(black_box(&b)).map(drop)))
        });
        group.bench_with_input(BenchmarkId::new("div", size), &size, |bench, _| {
            bench.iter(|| ctx.scoped(|_| black_box(&a).div(black_box(&b)).map(drop)))
        });
    }

    let rows = array(&ctx, &[256, 256]);
    let bias = array(&ctx, &[256]);
    group.bench_function("broadcast_add", |bench| {
        bench.iter(|| ctx.scoped(|_| black_box(&rows).add(black_box(&bias)).map(drop)))
    });

    group.finish();
}

// ===== UNARY OPERATIONS =====

fn bench_unary_ops(c: &mut Criterion) {
    let ctx = ctx();
    let mut group = c.benchmark_group("unary_ops");

    for size in [1024, 64 * 1024] {
        let a = array(&ctx, &[size]);
        group.bench_with_input(BenchmarkId::new("exp", size), &size, |bench, _| {
            bench.iter(|| ctx.scoped(|_| black_box(&a).exp().map(drop)))
        });
        group.bench_with_input(BenchmarkId::new("sigmoid", size), &size, |bench, _| {
            bench.iter(|| ctx.scoped(|_| black_box(&a).sigmoid().map(drop)))
        });
    }

    group.finish();
}

// ===== MATRIX MULTIPLICATION =====

fn bench_matmul(c: &mut Criterion) {
    let ctx = ctx();
    let mut group = c.benchmark_group("matmul");

    for n in [32, 128, 256] {
        let a = array(&ctx, &[n, n]);
        let b = array(&ctx, &[n, n]);
        group.bench_with_input(BenchmarkId::new("square", n), &n, |bench, _| {
            bench.iter(|| ctx.scoped(|_| black_box(&a).matmul(black_box(&b)).map(drop)))
        });
    }

    let batched = array(&ctx, &[16, 64, 64]);
    let shared = array(&ctx, &[64, 64]);
    group.bench_function("batched_16x64", |bench| {
        bench.iter(|| ctx.scoped(|_| black_box(&batched).matmul(black_box(&shared)).map(drop)))
    });

    group.finish();
}

// ===== REDUCTIONS =====

fn bench_reduce_ops(c: &mut Criterion) {
    let ctx = ctx();
    let mut group = c.benchmark_group("reduce_ops");
    let a = array(&ctx, &[512, 512]);

    group.bench_function("sum_all", |bench| {
        bench.iter(|| ctx.scoped(|_| black_box(&a).sum_all().map(drop)))
    });
    group.bench_function("sum_rows", |bench| {
        bench.iter(|| {
            ctx.scoped(|_| black_box(&a).sum_axes(&[-1], ReduceMode::Remove).map(drop))
        })
    });
    group.bench_function("sum_cols", |bench| {
        bench.iter(|| ctx.scoped(|_| black_box(&a).sum_axes(&[0], ReduceMode::Keep).map(drop)))
    });

    group.finish();
}

// ===== MOVEMENT =====

fn bench_movement_ops(c: &mut Criterion) {
    let ctx = ctx();
    let mut group = c.benchmark_group("movement_ops");
    let a = array(&ctx, &[256, 256]);

    group.bench_function("transpose_view", |bench| {
        bench.iter(|| ctx.scoped(|_| black_box(&a).transpose(None).map(drop)))
    });
    group.bench_function("transpose_contiguous", |bench| {
        bench.iter(|| ctx.scoped(|_| black_box(&a).transpose(None)?.contiguous().map(drop)))
    });

    group.finish();
}

// ===== TRAINING STEP =====

fn bench_training_step(c: &mut Criterion) {
    let ctx = ctx();
    let mut group = c.benchmark_group("training_step");
    let inputs = RawTensor::constant(array(&ctx, &[64, 32]));
    let w1 = RawTensor::param(ctx.normal(&[32, 64], 0.0, 0.1).expect("w1"));
    let w2 = RawTensor::param(ctx.normal(&[64, 10], 0.0, 0.1).expect("w2"));
    let labels: Vec<usize> = (0..64).map(|i| i % 10).collect();
    let params = [w1.clone(), w2.clone()];

    group.bench_function("mlp_64x32x64x10", |bench| {
        bench.iter(|| {
            ctx.model_iteration(&params[..], |_| {
                let loss = inputs
                    .matmul(&w1)?
                    .relu(0.0)?
                    .matmul(&w2)?
                    .softmax_cross_entropy(&labels)?;
                loss.backward()?;
                for p in &params {
                    p.update(|v, g| v.sub(&g.scale(0.01)?))?;
                }
                loss.val()?.item()
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_binary_ops,
    bench_unary_ops,
    bench_matmul,
    bench_reduce_ops,
    bench_movement_ops,
    bench_training_step
);
criterion_main!(benches);
