use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use crawl_control_plane::scheduler::fair_share;
use crawl_control_plane::store::{CoordinationStore, InMemoryStore};
use crawl_control_plane::types::{compute_crawl_rate, OutcomeCode, Source};

// Fast settings: this is a correctness-over-throughput crawl component, not
// a hot path under load, so a short run per group is enough to catch a
// regression in the per-tick arithmetic without slowing down local iteration.
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_compute_crawl_rate(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_crawl_rate");
    configure_fast_group(&mut group);

    group.bench_function("midpoint", |b| {
        b.iter(|| black_box(compute_crawl_rate(black_box(250_000_000.0))));
    });
    group.bench_function("below_floor", |b| {
        b.iter(|| black_box(compute_crawl_rate(black_box(100.0))));
    });
    group.bench_function("above_ceiling", |b| {
        b.iter(|| black_box(compute_crawl_rate(black_box(1e12))));
    });

    group.finish();
}

fn benchmark_fair_share(c: &mut Criterion) {
    let mut group = c.benchmark_group("fair_share");
    configure_fast_group(&mut group);

    group.bench_function("3000_over_8_sources", |b| {
        b.iter(|| black_box(fair_share(black_box(3000), black_box(8))));
    });
    group.bench_function("3000_over_3000_sources", |b| {
        b.iter(|| black_box(fair_share(black_box(3000), black_box(3000))));
    });

    group.finish();
}

fn benchmark_sliding_window_reap(c: &mut Criterion) {
    let mut group = c.benchmark_group("sliding_window_reap");
    configure_fast_group(&mut group);
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("reap_60s_window_with_stale_entries", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let store = InMemoryStore::new();
                    let source = Source::new("benchmark-source");
                    for i in 0..500 {
                        store
                            .record_outcome(&source, &OutcomeCode::Status(200), i as f64)
                            .await
                            .unwrap();
                    }
                    let start = Instant::now();
                    black_box(store.reap_window_60s(&source, 10_000.0).await.unwrap());
                    total += start.elapsed();
                }
                total
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_compute_crawl_rate,
    benchmark_fair_share,
    benchmark_sliding_window_reap
);
criterion_main!(benches);
