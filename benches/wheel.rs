//! Benchmarks for the producer path and the stop drain.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::time::Duration;
use tickwheel::{Timeout, WheelTimer};

const BATCH: u64 = 1_000;

/// One-hour ticks: the worker parks immediately and stays out of the way,
/// so the measurements isolate the lock-free producer path.
fn quiet_timer() -> WheelTimer {
    WheelTimer::builder()
        .tick_duration(Duration::from_secs(3600))
        .ticks_per_wheel(512)
        .build()
        .unwrap()
}

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/schedule");
    group.throughput(Throughput::Elements(BATCH));

    group.bench_function("burst_1k", |b| {
        b.iter_batched(
            quiet_timer,
            |timer| {
                for i in 0..BATCH {
                    let timeout = timer
                        .schedule(|_t: &Timeout| {}, Duration::from_millis(i))
                        .unwrap();
                    black_box(timeout);
                }
                timer
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_schedule_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/schedule_cancel");
    group.throughput(Throughput::Elements(BATCH));

    group.bench_function("churn_1k", |b| {
        b.iter_batched(
            quiet_timer,
            |timer| {
                for i in 0..BATCH {
                    let timeout = timer
                        .schedule(|_t: &Timeout| {}, Duration::from_millis(i))
                        .unwrap();
                    black_box(timeout.cancel());
                }
                timer
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_stop_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/stop_drain");
    group.throughput(Throughput::Elements(10 * BATCH));

    group.bench_function("pending_10k", |b| {
        b.iter_batched(
            || {
                let timer = quiet_timer();
                for i in 0..10 * BATCH {
                    timer
                        .schedule(|_t: &Timeout| {}, Duration::from_secs(i))
                        .unwrap();
                }
                timer
            },
            |timer| black_box(timer.stop()),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_schedule,
    bench_schedule_cancel,
    bench_stop_drain
);
criterion_main!(benches);
