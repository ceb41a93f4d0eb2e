use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dhtwatch_sdk::{Poller, SimulatedSampler};
use std::thread;
use std::time::Duration;

/// Benchmark concurrent `latest()` reads on an idle poller
fn bench_concurrent_latest_idle(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_latest_idle");

    for thread_count in [1, 2, 4, 8, 16].iter() {
        group.throughput(Throughput::Elements(*thread_count as u64 * 1000));
        group.bench_with_input(
            BenchmarkId::new("threads", thread_count),
            thread_count,
            |b, &thread_count| {
                let poller = Poller::builder(SimulatedSampler::new()).build();

                b.iter(|| {
                    thread::scope(|scope| {
                        for _ in 0..thread_count {
                            let poller = poller.clone();
                            scope.spawn(move || {
                                for _ in 0..1000 {
                                    black_box(poller.latest());
                                }
                            });
                        }
                    });
                });
            },
        );
    }
    group.finish();
}

/// Benchmark reads while a fast sampling loop keeps publishing
fn bench_latest_while_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("latest_while_sampling");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let poller = rt.block_on(async {
        let poller = Poller::builder(SimulatedSampler::new())
            .interval(Duration::from_micros(50))
            .build();
        poller.start();
        poller
    });

    for thread_count in [1, 4, 8].iter() {
        group.throughput(Throughput::Elements(*thread_count as u64 * 1000));
        group.bench_with_input(
            BenchmarkId::from_parameter(thread_count),
            thread_count,
            |b, &thread_count| {
                b.iter(|| {
                    thread::scope(|scope| {
                        for _ in 0..thread_count {
                            let poller = poller.clone();
                            scope.spawn(move || {
                                for _ in 0..1000 {
                                    black_box(poller.latest());
                                }
                            });
                        }
                    });
                });
            },
        );
    }
    group.finish();

    rt.block_on(poller.stop());
}

criterion_group!(
    benches,
    bench_concurrent_latest_idle,
    bench_latest_while_sampling
);
criterion_main!(benches);
