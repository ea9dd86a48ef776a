//! Basic benchmarks for the `unordered_pool` crate, with `Box` as the baseline.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use alloc_tracker::Allocator;
use criterion::{Criterion, criterion_group, criterion_main};
use new_zealand::nz;
use unordered_pool::{TypedUnorderedPool, TypedUnorderedTrivialPool, UnorderedTrivialPool};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

type TestItem = [u64; 3];
const TEST_VALUE: TestItem = [1024; 3];

/// Number of entries kept live by the churn benchmarks.
const BATCH_SIZE: usize = 1000;

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("unordered_basic");

    let allocs_op = allocs.operation("box_acquire_free");
    group.bench_function("box_acquire_free", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(Box::new(black_box(TEST_VALUE))));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("typed_trivial_acquire_free");
    group.bench_function("typed_trivial_acquire_free", |b| {
        b.iter_custom(|iters| {
            let mut pool = TypedUnorderedTrivialPool::<TestItem>::new(nz!(128));

            // Warm up so the measured loop reuses the same page.
            let warm = pool.acquire().unwrap();
            // SAFETY: The entry was acquired from this pool and is not used afterwards.
            unsafe { pool.free(warm) };

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let entry = pool.acquire().unwrap();

                // SAFETY: The chunk is sized and aligned for TestItem and we own it.
                unsafe { entry.write(black_box(TEST_VALUE)) };

                // SAFETY: The entry was acquired from this pool and is not used afterwards.
                unsafe { pool.free(black_box(entry)) };
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("typed_acquire_free");
    group.bench_function("typed_acquire_free", |b| {
        b.iter_custom(|iters| {
            let mut pool = TypedUnorderedPool::<TestItem>::new(nz!(128));

            let warm = pool.acquire().unwrap();
            // SAFETY: The entry was acquired from this pool and is not used afterwards.
            unsafe { pool.free(warm) };

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let entry = pool.acquire().unwrap();

                // SAFETY: The entry was acquired from this pool and is not used afterwards.
                unsafe { pool.free(black_box(entry)) };
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("box_batch");
    group.bench_function("box_batch", |b| {
        b.iter_custom(|iters| {
            let mut boxes = Vec::with_capacity(BATCH_SIZE);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                boxes.extend(iter::repeat_with(|| Box::new(TEST_VALUE)).take(BATCH_SIZE));
                boxes.clear();
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("untyped_trivial_batch");
    group.bench_function("untyped_trivial_batch", |b| {
        b.iter_custom(|iters| {
            let mut pool = UnorderedTrivialPool::builder()
                .chunk_layout_of::<TestItem>()
                .build();
            let mut chunks = Vec::with_capacity(BATCH_SIZE);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                chunks.extend(iter::repeat_with(|| pool.acquire().unwrap()).take(BATCH_SIZE));

                for chunk in chunks.drain(..) {
                    // SAFETY: The chunk was acquired from this pool and is not used afterwards.
                    unsafe { pool.free(chunk) };
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("untyped_trivial_batch_shrink");
    group.bench_function("untyped_trivial_batch_shrink", |b| {
        b.iter_custom(|iters| {
            let mut pool = UnorderedTrivialPool::builder()
                .chunk_layout_of::<TestItem>()
                .build();
            let mut chunks = Vec::with_capacity(BATCH_SIZE);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                chunks.extend(iter::repeat_with(|| pool.acquire().unwrap()).take(BATCH_SIZE));

                for chunk in chunks.drain(..) {
                    // SAFETY: The chunk was acquired from this pool and is not used afterwards.
                    unsafe { pool.free(chunk) };
                }

                pool.shrink();
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
