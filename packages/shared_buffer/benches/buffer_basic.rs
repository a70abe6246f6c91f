//! Basic benchmarks for standalone buffers of the `shared_buffer` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use shared_buffer::BufferRef;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BUFFER_SIZE: usize = 4096;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_basic");

    group.bench_function("alloc_and_release", |b| {
        b.iter(|| drop(black_box(BufferRef::alloc(black_box(BUFFER_SIZE)).unwrap())));
    });

    group.bench_function("clone", |b| {
        b.iter_custom(|iters| {
            let buffer = BufferRef::alloc(BUFFER_SIZE).unwrap();
            let mut clones = Vec::with_capacity(usize::try_from(iters).unwrap());

            let start = Instant::now();

            for _ in 0..iters {
                clones.push(black_box(buffer.clone()));
            }

            let elapsed = start.elapsed();
            drop(clones);
            elapsed
        });
    });

    group.bench_function("get_mut_exclusive", |b| {
        let mut buffer = BufferRef::alloc(BUFFER_SIZE).unwrap();

        b.iter(|| {
            if let Some(contents) = black_box(buffer.get_mut()) {
                contents.fill(1);
            }
        });
    });

    group.bench_function("realloc_in_place", |b| {
        b.iter_custom(|iters| {
            let mut slots = iter::repeat_with(|| {
                let mut slot = None;
                BufferRef::realloc(&mut slot, BUFFER_SIZE).unwrap();
                slot
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let start = Instant::now();

            for slot in &mut slots {
                black_box(BufferRef::realloc(slot, BUFFER_SIZE * 2).unwrap());
            }

            start.elapsed()
        });
    });

    group.bench_function("realloc_shared_copy", |b| {
        b.iter_custom(|iters| {
            let original = BufferRef::alloc_zeroed(BUFFER_SIZE).unwrap();
            let mut slots = iter::repeat_with(|| Some(original.clone()))
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for slot in &mut slots {
                black_box(BufferRef::realloc(slot, BUFFER_SIZE * 2).unwrap());
            }

            start.elapsed()
        });
    });

    group.finish();
}
