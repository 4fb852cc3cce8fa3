//! Dispatch-path benchmarks.
//!
//! Measures enqueue plus dispatch throughput across class counts, and the
//! raw cost of the group's atomic capacity operations.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sluice_flow::{
    FairGroup, FairGroupConfig, FairQueue, FairQueueConfig, FairQueueEntry, Ticket,
};

const BATCH: u64 = 1_000;

/// A group with a large pre-granted window so capacity never pauses
/// dispatch inside the measurement.
fn open_group() -> Arc<FairGroup> {
    let config = FairGroupConfig::for_testing()
        .with_rate_factor(1024.0)
        .with_rate_limit_duration_us(100_000_000);
    let group = Arc::new(FairGroup::new(&config, 0));
    group.replenish_capacity(100_000_000);
    group
}

fn bench_enqueue_dispatch(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("enqueue_dispatch");
    bench_group.throughput(Throughput::Elements(BATCH));

    for class_count in [1_u32, 4, 16] {
        bench_group.bench_with_input(
            BenchmarkId::from_parameter(class_count),
            &class_count,
            |b, &class_count| {
                let group = open_group();
                let mut queue: FairQueue<u64> =
                    FairQueue::new(Arc::clone(&group), FairQueueConfig::for_testing());
                for id in 0..class_count {
                    queue.register_priority_class(id, 100 * (id + 1)).unwrap();
                }

                b.iter(|| {
                    for seq in 0..BATCH {
                        let class = (seq % u64::from(class_count)) as u32;
                        queue
                            .queue(class, FairQueueEntry::new(Ticket::new(1, 4096), seq))
                            .unwrap();
                    }
                    queue.dispatch_requests(|entry| {
                        black_box(entry.payload());
                    });
                    // Return everything so the group window never drains.
                    for _ in 0..BATCH {
                        queue.notify_request_finished(Ticket::new(1, 4096));
                    }
                });
            },
        );
    }
    bench_group.finish();
}

fn bench_group_rovers(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("group_rovers");
    bench_group.throughput(Throughput::Elements(1));

    let group = open_group();
    bench_group.bench_function("grab_release", |b| {
        b.iter(|| {
            let prior = group.grab_capacity(black_box(64));
            group.release_capacity(64);
            black_box(prior);
        });
    });

    let ticket = Ticket::new(1, 4096);
    bench_group.bench_function("ticket_capacity", |b| {
        b.iter(|| black_box(group.ticket_capacity(black_box(ticket))));
    });

    bench_group.finish();
}

criterion_group!(benches, bench_enqueue_dispatch, bench_group_rovers);
criterion_main!(benches);
