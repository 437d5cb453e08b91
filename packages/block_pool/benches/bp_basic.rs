//! Basic benchmarks for the `block_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::num::NonZero;
use std::time::Instant;

use block_pool::BlockPool;
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = usize;
const TEST_VALUE: TestItem = 1024;

const CHUNKS_PER_BLOCK: NonZero<usize> = NonZero::new(128).unwrap();
const MAX_BLOCKS: NonZero<usize> = NonZero::new(16).unwrap();

fn new_pool() -> BlockPool<TestItem> {
    BlockPool::new(CHUNKS_PER_BLOCK, MAX_BLOCKS)
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("bp_basic");

    group.bench_function("build_empty", |b| {
        b.iter(|| drop(black_box(new_pool())));
    });

    group.bench_function("allocate_first", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(new_pool)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &mut pools {
                _ = black_box(pool.allocate(black_box(TEST_VALUE)));
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_second", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(new_pool)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            // Pre-warm each pool with one item, so the block already exists.
            for pool in &mut pools {
                _ = pool.allocate(TEST_VALUE).unwrap();
            }

            let start = Instant::now();

            for pool in &mut pools {
                _ = black_box(pool.allocate(black_box(TEST_VALUE)));
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_deallocate_reused", |b| {
        let mut pool = new_pool();

        // Keep one chunk allocated so the block is never empty.
        let anchor = pool.allocate(TEST_VALUE).unwrap();

        b.iter(|| {
            let chunk = pool.allocate(black_box(TEST_VALUE)).unwrap();
            pool.deallocate(black_box(chunk));
        });

        pool.deallocate(anchor);
    });

    group.bench_function("fill_and_drain", |b| {
        let mut pool = new_pool();
        let mut chunks = Vec::with_capacity(pool.max_capacity());

        b.iter(|| {
            while let Ok(chunk) = pool.allocate(black_box(TEST_VALUE)) {
                chunks.push(chunk);
            }

            for chunk in chunks.drain(..) {
                pool.deallocate(chunk);
            }
        });
    });

    group.finish();
}
