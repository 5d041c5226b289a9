// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use workqueue::{CpuCount, CpuId, Work, WorkQueueBuilder};

const QUEUE_COUNTS: &[usize] = &[1, 2, 4, 8];
const BURST_LENGTHS: &[usize] = &[100, 1_000, 10_000];

/// Latency of one enqueue-then-wait round trip through a single queue.
fn round_trip(c: &mut Criterion) {
    let counter = Arc::new(AtomicUsize::new(0));
    let wq = WorkQueueBuilder::new("bench-round-trip")
        .build(
            |_: &(), counter: &Arc<AtomicUsize>| {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            counter,
        )
        .unwrap();

    c.bench_function("round_trip", |bencher| {
        bencher.iter(|| {
            let work = Work::new(());
            wq.enqueue(&work, None);
            wq.wait(&work);
        });
    });

    wq.destroy();
}

/// Throughput of bursts of items spread over a varying number of queues.
fn burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("burst");
    for &len in BURST_LENGTHS {
        group.throughput(Throughput::Elements(len as u64));
        for &num_queues in QUEUE_COUNTS {
            let mut builder = WorkQueueBuilder::new("bench-burst");
            builder.flags.per_cpu = num_queues > 1;
            builder.flags.mpsafe = true;
            builder.cpus = CpuCount::try_from(num_queues).unwrap();
            let counter = Arc::new(AtomicUsize::new(0));
            let wq = builder
                .build(
                    |_: &usize, counter: &Arc<AtomicUsize>| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    },
                    counter,
                )
                .unwrap();

            group.bench_with_input(
                BenchmarkId::new(format!("queues@{num_queues}"), len),
                &len,
                |bencher, &len| {
                    bencher.iter(|| {
                        let works: Vec<Work<usize>> = (0..len).map(Work::new).collect();
                        for (i, work) in works.iter().enumerate() {
                            wq.enqueue(work, Some(CpuId(i)));
                        }
                        for work in &works {
                            wq.wait(work);
                        }
                    });
                },
            );

            wq.destroy();
        }
    }
    group.finish();
}

criterion_group!(benches, round_trip, burst);
criterion_main!(benches);
