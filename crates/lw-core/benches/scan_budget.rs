use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lw_core::compute_scan_budget;

fn bench_scan_budget(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_budget");

    group.bench_function("steady_state", |b| {
        b.iter(|| {
            compute_scan_budget(
                black_box(1_000_000),
                black_box(125_000),
                black_box(1_000_000),
                black_box(4096),
            )
        });
    });

    group.bench_function("bursty_foreground", |b| {
        b.iter(|| {
            compute_scan_budget(
                black_box(2_000_000),
                black_box(125_000),
                black_box(400_000),
                black_box(4096),
            )
        });
    });

    group.finish();
}

criterion_group!(benches, bench_scan_budget);
criterion_main!(benches);
