//! Benchmarks for the distillation and regularization losses.
//!
//! Run with: cargo bench -p stylekd-distill

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mlx_rs::Array;
use stylekd_distill::{d_logistic_loss, kernel_alignment, r1_penalty, PerceptualLoss};

/// Deterministic pseudo-random NCHW batch.
fn feature_map(batch: usize, channels: usize, size: usize, salt: f32) -> Array {
    let len = batch * channels * size * size;
    let data: Vec<f32> = (0..len)
        .map(|i| ((i as f32 * 0.618_034 + salt) % 2.0) - 1.0)
        .collect();
    Array::from_slice(
        &data,
        &[batch as i32, channels as i32, size as i32, size as i32],
    )
}

fn bench_kernel_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_alignment");
    group.sample_size(30);

    let configs = [
        (8, 64, 16, "8x64x16"),
        (16, 128, 32, "16x128x32"),
        (16, 256, 64, "16x256x64"),
    ];

    for (batch, channels, size, name) in configs {
        let student = feature_map(batch, channels, size, 0.1);
        let teacher = feature_map(batch, channels * 2, size, 0.7);
        group.throughput(Throughput::Elements((batch * channels * size * size) as u64));
        group.bench_with_input(BenchmarkId::new("gram", name), &(&student, &teacher), |b, (s, t)| {
            b.iter(|| {
                let ka = kernel_alignment(s, t).unwrap();
                ka.eval().unwrap();
                black_box(ka)
            });
        });
    }

    group.finish();
}

fn bench_perceptual(c: &mut Criterion) {
    let mut group = c.benchmark_group("perceptual");
    group.sample_size(30);
    let loss = PerceptualLoss::default();

    for size in [64usize, 128, 256] {
        let a = feature_map(8, 3, size, 0.2);
        let b = feature_map(8, 3, size, 0.9);
        group.bench_with_input(BenchmarkId::new("laplacian", size), &(&a, &b), |bench, (a, b)| {
            bench.iter(|| {
                let d = loss.distance(a, b).unwrap();
                d.eval().unwrap();
                black_box(d)
            });
        });
    }

    group.finish();
}

fn bench_r1(c: &mut Criterion) {
    let mut group = c.benchmark_group("r1_penalty");
    group.sample_size(30);

    let weights = feature_map(1, 3, 64, 0.3);
    let real = feature_map(16, 3, 64, 0.5);
    group.bench_function("linear_critic_16x3x64", |b| {
        b.iter(|| {
            let penalty = r1_penalty(
                |x: &Array| x.multiply(&weights)?.sum_axes(&[1, 2, 3], None),
                &real,
            )
            .unwrap();
            penalty.eval().unwrap();
            black_box(penalty)
        });
    });

    let real_pred = feature_map(16, 1, 1, 0.4).reshape(&[16, 1]).unwrap();
    let fake_pred = feature_map(16, 1, 1, 0.8).reshape(&[16, 1]).unwrap();
    group.bench_function("d_logistic_16", |b| {
        b.iter(|| black_box(d_logistic_loss(&real_pred, &fake_pred).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_kernel_alignment, bench_perceptual, bench_r1);
criterion_main!(benches);
