//! Benchmarks comparing pooled buffers against direct allocation.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::thread;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use shared_buffer::{BufferPool, BufferRef, ReusePolicy};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BUFFER_SIZE: usize = 16 * 1024;
const THREADS: usize = 4;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_recycling");

    group.bench_function("direct_alloc", |b| {
        b.iter(|| drop(black_box(BufferRef::alloc(BUFFER_SIZE).unwrap())));
    });

    let pool = BufferPool::new(BUFFER_SIZE);
    drop(pool.get().unwrap());

    group.bench_function("pool_get_warm", |b| {
        b.iter(|| drop(black_box(pool.get().unwrap())));
    });

    let zeroed = BufferPool::builder()
        .buffer_size(BUFFER_SIZE)
        .reuse_policy(ReusePolicy::Zeroed)
        .build();
    drop(zeroed.get().unwrap());

    group.bench_function("pool_get_warm_zeroed", |b| {
        b.iter(|| drop(black_box(zeroed.get().unwrap())));
    });

    group.bench_function("pool_get_multithreaded", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            thread::scope(|scope| {
                for _ in 0..THREADS {
                    scope.spawn(|| {
                        for _ in 0..iters {
                            drop(black_box(pool.get().unwrap()));
                        }
                    });
                }
            });

            start.elapsed()
        });
    });

    group.finish();
}
