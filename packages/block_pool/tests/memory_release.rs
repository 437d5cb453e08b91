//! Verifies through an independent allocation counter that a pool returns all block memory to
//! the system allocator when it is dropped, and that a pool survives the system allocator
//! refusing a block.
//!
//! Kept in its own test binary because it installs a global allocator. Byte counts and refusal
//! thresholds are kept per thread, so tests running in parallel do not disturb each other.
#![allow(
    missing_docs,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::num::NonZero;
use std::ptr;

use block_pool::{BlockPool, DropPolicy, Error};

/// Wraps the system allocator and tracks the number of bytes currently allocated by each thread.
///
/// Each thread can also make the allocator refuse requests from a given size upwards.
struct CountingAllocator;

thread_local! {
    // Const-initialized without drop glue, so accessing them never allocates.
    static OUTSTANDING_BYTES: Cell<i64> = const { Cell::new(0) };
    static REFUSE_FROM_SIZE: Cell<Option<usize>> = const { Cell::new(None) };
}

fn should_refuse(size: usize) -> bool {
    REFUSE_FROM_SIZE
        .try_with(Cell::get)
        .ok()
        .flatten()
        .is_some_and(|min_size| size >= min_size)
}

/// Runs `f` while every allocation of at least `min_size` bytes on this thread fails.
fn with_refused_allocations<R>(min_size: usize, f: impl FnOnce() -> R) -> R {
    REFUSE_FROM_SIZE.with(|refuse| refuse.set(Some(min_size)));
    let result = f();
    REFUSE_FROM_SIZE.with(|refuse| refuse.set(None));
    result
}

fn record(delta: i64) {
    // During thread teardown the counter may already be gone; such allocations are not ours.
    _ = OUTSTANDING_BYTES.try_with(|bytes| bytes.set(bytes.get().wrapping_add(delta)));
}

fn outstanding() -> i64 {
    OUTSTANDING_BYTES.with(Cell::get)
}

fn as_delta(size: usize) -> i64 {
    i64::try_from(size).expect("allocation sizes fit in i64")
}

// SAFETY: We forward every call to the system allocator, except for requests we refuse by
// returning null, which the `GlobalAlloc` contract permits.
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if should_refuse(layout.size()) {
            return ptr::null_mut();
        }

        let ptr = unsafe { System.alloc(layout) };

        if !ptr.is_null() {
            record(as_delta(layout.size()));
        }

        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };

        record(-as_delta(layout.size()));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if new_size > layout.size() && should_refuse(new_size) {
            return ptr::null_mut();
        }

        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };

        if !new_ptr.is_null() {
            record(as_delta(new_size) - as_delta(layout.size()));
        }

        new_ptr
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

fn nz(value: usize) -> NonZero<usize> {
    NonZero::new(value).unwrap()
}

/// Runs `f` and returns how many bytes it left allocated.
fn outstanding_after(f: impl FnOnce()) -> i64 {
    let before = outstanding();
    f();
    outstanding() - before
}

#[derive(Debug)]
struct Item {
    x: i32,
    y: i32,
    speed: f64,
}

#[test]
fn full_cycle_releases_all_block_memory() {
    let leaked = outstanding_after(|| {
        let mut pool = BlockPool::<Item>::new(nz(8), nz(2));

        let mut chunks = Vec::with_capacity(16);
        for n in 0..16 {
            chunks.push(
                pool.allocate(Item {
                    x: n,
                    y: n,
                    speed: 0.5,
                })
                .unwrap(),
            );
        }

        assert_eq!(pool.block_count(), 2);
        let item = pool.get(&chunks[3]);
        assert_eq!(item.x + item.y, 6);
        assert!(item.speed > 0.0);

        for chunk in chunks.into_iter().rev() {
            pool.deallocate(chunk);
        }

        drop(pool);
    });

    assert_eq!(leaked, 0);
}

#[test]
fn blocks_are_held_until_pool_is_dropped() {
    let baseline = outstanding();

    let mut pool = BlockPool::<u64>::new(nz(64), nz(1));
    let registry_only = outstanding();

    let chunk = pool.allocate(1).unwrap();
    let with_block = outstanding();
    assert!(with_block - registry_only >= as_delta(64 * size_of::<u64>()));

    // Releasing a chunk does not return memory to the system.
    pool.deallocate(chunk);
    assert_eq!(outstanding(), with_block);

    drop(pool);
    assert_eq!(outstanding(), baseline);
}

#[test]
fn abandoned_chunks_still_release_block_memory() {
    let leaked = outstanding_after(|| {
        let mut pool = BlockPool::<u64>::builder()
            .chunks_per_block(nz(4))
            .max_blocks(nz(3))
            .drop_policy(DropPolicy::AbandonItems)
            .build();

        let chunks = (0..10).map(|n| pool.allocate(n).unwrap()).collect::<Vec<_>>();
        assert_eq!(pool.block_count(), 3);

        drop(pool);
        drop(chunks);
    });

    assert_eq!(leaked, 0);
}

#[test]
fn dropped_items_release_their_own_memory() {
    let leaked = outstanding_after(|| {
        let mut pool = BlockPool::<String>::builder()
            .chunks_per_block(nz(4))
            .max_blocks(nz(2))
            .drop_policy(DropPolicy::DropItems)
            .build();

        let chunks = (0..6)
            .map(|n| pool.allocate(format!("item number {n}")).unwrap())
            .collect::<Vec<_>>();

        drop(pool);
        drop(chunks);
    });

    assert_eq!(leaked, 0);
}

#[test]
fn exhaustion_allocates_nothing() {
    let mut pool = BlockPool::<u32>::new(nz(2), nz(1));
    let a = pool.allocate(1).unwrap();
    let b = pool.allocate(2).unwrap();

    let before = outstanding();
    assert!(pool.allocate(3).is_err());
    assert_eq!(outstanding(), before);

    pool.deallocate(a);
    pool.deallocate(b);
}

/// Smallest block size for a pool of `u64` with the given number of chunks per block.
fn min_block_size(chunks_per_block: usize) -> usize {
    chunks_per_block * size_of::<u64>()
}

#[test]
fn refused_first_block_leaves_pool_usable() {
    let mut pool = BlockPool::<u64>::new(nz(512), nz(2));

    let result = with_refused_allocations(min_block_size(512), || pool.allocate(1));

    assert!(matches!(
        result,
        Err(Error::BlockAllocation { block_index: 0, size, .. }) if size >= min_block_size(512)
    ));
    assert_eq!(pool.block_count(), 0);
    assert_eq!(pool.capacity(), 0);
    assert!(pool.is_empty());
    assert!(!pool.is_exhausted());

    // Once memory is available again, the same block index is created.
    let chunk = pool.allocate(2).unwrap();
    assert_eq!(chunk.index(), 0);
    assert_eq!(pool.block_count(), 1);
    assert_eq!(*pool.get(&chunk), 2);

    pool.deallocate(chunk);
}

#[test]
fn refused_later_block_keeps_existing_chunks() {
    let leaked = outstanding_after(|| {
        let mut pool = BlockPool::<u64>::new(nz(512), nz(2));

        let mut chunks = Vec::with_capacity(513);
        for n in 0..512 {
            chunks.push(pool.allocate(n).unwrap());
        }
        assert_eq!(pool.block_count(), 1);

        let result = with_refused_allocations(min_block_size(512), || pool.allocate(512));

        assert!(matches!(
            result,
            Err(Error::BlockAllocation { block_index: 1, .. })
        ));
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.len(), 512);
        assert_eq!(pool.capacity(), 512);
        assert!(!pool.is_exhausted());
        assert_eq!(*pool.get(&chunks[100]), 100);

        // The next allocation retries the block and continues the numbering.
        let chunk = pool.allocate(512).unwrap();
        assert_eq!(chunk.index(), 512);
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.len(), 513);
        chunks.push(chunk);

        for chunk in chunks {
            pool.deallocate(chunk);
        }

        assert!(pool.is_empty());
    });

    assert_eq!(leaked, 0);
}
