use std::any::type_name;
use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::{Block, BlockPoolBuilder, Chunk, Diagnostics, DropPolicy, Error, Result};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique pool ID.
fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A bounded pool of fixed-size chunks, each holding one `T`, allocated in blocks.
///
/// The pool grows one block at a time, on demand, up to a maximum number of blocks fixed at
/// construction. Once every chunk of every permitted block is allocated, [`allocate()`][1]
/// returns [`Error::Exhausted`] until a chunk is returned to the pool.
///
/// # Free list
///
/// Chunks that are not allocated form a single intrusive free list: each vacant chunk stores
/// the index of the next vacant chunk in its own storage. When a block is created, all of its
/// chunks are threaded onto the free list in address order. Released chunks are pushed onto
/// the head of the list. Both allocation and release are therefore a constant-time list
/// operation, and the most recently released chunk is the next one to be handed out.
///
/// A new block is only created once the free list is empty, which means every chunk of every
/// existing block is allocated.
///
/// # Handles
///
/// Allocation returns a [`Chunk<T>`] handle that owns the value. The value is accessed through
/// the pool with [`get()`][4] and [`get_mut()`][5], so it can never be reached once the pool is
/// gone. The handle is consumed when the chunk is returned via [`deallocate()`][2] or
/// [`take()`][3]. Passing a handle to a pool other than the one that issued it is detected and
/// panics.
///
/// # Resource usage
///
/// Block memory is never returned to the system before the pool itself is dropped.
/// Released chunks are only made available to later allocations from the same pool.
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`] if `T` is [`Send`]) but not thread-safe ([`Sync`]).
/// Concurrent use requires external synchronization such as a [`Mutex`][std::sync::Mutex].
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use block_pool::{BlockPool, Error};
///
/// // Two blocks of two chunks each.
/// let mut pool = BlockPool::<u64>::new(NonZero::new(2).unwrap(), NonZero::new(2).unwrap());
///
/// let chunks = (0..4)
///     .map(|i| pool.allocate(i).unwrap())
///     .collect::<Vec<_>>();
///
/// assert_eq!(pool.block_count(), 2);
/// assert!(matches!(pool.allocate(4), Err(Error::Exhausted { .. })));
///
/// for chunk in chunks {
///     pool.deallocate(chunk);
/// }
///
/// assert!(pool.is_empty());
/// ```
///
/// [1]: Self::allocate
/// [2]: Self::deallocate
/// [3]: Self::take
/// [4]: Self::get
/// [5]: Self::get_mut
#[derive(Debug)]
pub struct BlockPool<T> {
    /// We need to uniquely identify each pool to ensure that handles are not returned to the
    /// wrong pool. If the pool ID does not match when a handle is returned, we panic.
    pool_id: u64,

    chunks_per_block: NonZero<usize>,

    max_blocks: NonZero<usize>,

    /// Blocks in creation order. Storage for `max_blocks` entries is reserved at construction,
    /// so registering a block never reallocates the registry.
    blocks: Vec<Block<T>>,

    /// Flat index of the first vacant chunk, if any. Every other vacant chunk is reachable from
    /// here through the links stored in the vacant chunks themselves.
    free_list_head: Option<usize>,

    /// Number of allocated chunks. Tracked explicitly to avoid summing across blocks.
    length: usize,

    drop_policy: DropPolicy,

    diagnostics: Diagnostics,
}

impl<T> BlockPool<T> {
    /// Creates a pool with `chunks_per_block` chunks in each block and at most `max_blocks`
    /// blocks, using default settings for everything else.
    ///
    /// The pool starts without any blocks. See [`builder()`][Self::builder] for further options.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`BlockPoolBuilder::build()`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::<f64>::new(NonZero::new(8).unwrap(), NonZero::new(2).unwrap());
    ///
    /// assert_eq!(pool.chunks_per_block(), 8);
    /// assert_eq!(pool.max_blocks(), 2);
    /// assert_eq!(pool.block_count(), 0);
    /// ```
    #[must_use]
    pub fn new(chunks_per_block: NonZero<usize>, max_blocks: NonZero<usize>) -> Self {
        Self::builder()
            .chunks_per_block(chunks_per_block)
            .max_blocks(max_blocks)
            .build()
    }

    /// Starts building a new [`BlockPool`].
    pub fn builder() -> BlockPoolBuilder<T> {
        BlockPoolBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(
        chunks_per_block: NonZero<usize>,
        max_blocks: NonZero<usize>,
        drop_policy: DropPolicy,
        diagnostics: Diagnostics,
    ) -> Self {
        assert!(
            chunks_per_block.checked_mul(max_blocks).is_some(),
            "{max_blocks} blocks of {chunks_per_block} chunks of {} exceed the addressable chunk count",
            type_name::<T>()
        );

        // Validates the block size up front, so creating a block later can only fail on
        // the system allocator refusing the memory.
        _ = Block::<T>::layout(chunks_per_block);

        let pool_id = generate_pool_id();

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(max_blocks.get())
            .unwrap_or_else(|e| {
                panic!("cannot reserve a block registry for {max_blocks} blocks: {e}")
            });

        diagnostics.registry_reserved(pool_id, max_blocks.get());

        Self {
            pool_id,
            chunks_per_block,
            max_blocks,
            blocks,
            free_list_head: None,
            length: 0,
            drop_policy,
            diagnostics,
        }
    }

    /// Size in bytes of the values stored in the chunks of this pool.
    #[must_use]
    #[inline]
    pub fn chunk_size(&self) -> usize {
        size_of::<T>()
    }

    /// Number of chunks in each block.
    #[must_use]
    #[inline]
    pub fn chunks_per_block(&self) -> usize {
        self.chunks_per_block.get()
    }

    /// Maximum number of blocks this pool will ever create.
    #[must_use]
    #[inline]
    pub fn max_blocks(&self) -> usize {
        self.max_blocks.get()
    }

    /// Number of blocks created so far.
    #[must_use]
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of chunks currently allocated.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<i32>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
    /// assert_eq!(pool.len(), 0);
    ///
    /// let chunk = pool.allocate(42).unwrap();
    /// assert_eq!(pool.len(), 1);
    ///
    /// pool.deallocate(chunk);
    /// assert_eq!(pool.len(), 0);
    /// ```
    #[must_use]
    #[inline]
    #[cfg_attr(test, mutants::skip)] // Statistics only, does not affect allocation behavior.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether no chunks are currently allocated.
    ///
    /// An empty pool may still be holding blocks.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of chunks in the blocks created so far, allocated or not.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks_per_block
            .get()
            .checked_mul(self.blocks.len())
            .expect("guarded by the capacity overflow check at construction")
    }

    /// Number of chunks the pool can hold once all permitted blocks have been created.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.chunks_per_block
            .get()
            .checked_mul(self.max_blocks.get())
            .expect("guarded by the capacity overflow check at construction")
    }

    /// Whether the next allocation would fail because every chunk of every permitted block
    /// is allocated.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.free_list_head.is_none() && self.blocks.len() >= self.max_blocks.get()
    }

    /// Stores `value` in a chunk and returns a handle to it.
    ///
    /// The most recently released chunk is reused first. If no chunk is vacant, a new block is
    /// created as long as the block limit has not been reached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] if all chunks of all permitted blocks are allocated and
    /// [`Error::BlockAllocation`] if the system allocator refuses the memory for a new block.
    /// In both cases `value` is dropped.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::{BlockPool, Error};
    ///
    /// let mut pool = BlockPool::<u32>::new(NonZero::new(1).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let first = pool.allocate(1).unwrap();
    /// assert!(matches!(pool.allocate(2), Err(Error::Exhausted { .. })));
    ///
    /// pool.deallocate(first);
    /// let second = pool.allocate(3).unwrap();
    /// assert_eq!(*pool.get(&second), 3);
    /// # pool.deallocate(second);
    /// ```
    pub fn allocate(&mut self, value: T) -> Result<Chunk<T>> {
        self.allocate_with(|| value)
    }

    /// Stores the value returned by `f` in a chunk and returns a handle to it.
    ///
    /// `f` is only called once a chunk is available, so no value is created when the pool
    /// is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] if all chunks of all permitted blocks are allocated and
    /// [`Error::BlockAllocation`] if the system allocator refuses the memory for a new block.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<Vec<u8>>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let buffer = pool.allocate_with(|| Vec::with_capacity(1024)).unwrap();
    /// assert!(pool.get(&buffer).capacity() >= 1024);
    /// # pool.deallocate(buffer);
    /// ```
    pub fn allocate_with(&mut self, f: impl FnOnce() -> T) -> Result<Chunk<T>> {
        #[cfg(debug_assertions)]
        self.integrity_check();

        let index = match self.free_list_head {
            Some(index) => index,
            None => self.add_block()?,
        };

        // The chunk stays at the head of the free list until the value exists, so a panic
        // in `f` leaves the pool consistent.
        let value = f();

        let (block_index, index_in_block) = self.coordinates(index);

        let block = self
            .blocks
            .get_mut(block_index)
            .expect("free list only links chunks of created blocks");

        let (ptr, next_free_index) = block.occupy(index_in_block, value);

        self.free_list_head = next_free_index;

        self.length = self
            .length
            .checked_add(1)
            .expect("cannot exceed the capacity, which is guarded against overflow");

        self.diagnostics
            .chunk_allocated(self.pool_id, index, ptr.cast());

        Ok(Chunk::new(self.pool_id, index, ptr))
    }

    /// Gets a shared reference to the value stored in a chunk.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by a different pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<String>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let chunk = pool.allocate("Hello".to_string()).unwrap();
    /// assert_eq!(pool.get(&chunk), "Hello");
    /// # pool.deallocate(chunk);
    /// ```
    #[must_use]
    pub fn get(&self, chunk: &Chunk<T>) -> &T {
        self.assert_issued_here(chunk);

        let (block_index, index_in_block) = self.coordinates(chunk.index());

        self.blocks
            .get(block_index)
            .map(|block| block.value(index_in_block))
            .expect("a chunk issued by this pool always belongs to one of its blocks")
    }

    /// Gets an exclusive reference to the value stored in a chunk.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by a different pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<String>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let chunk = pool.allocate("Hello".to_string()).unwrap();
    /// pool.get_mut(&chunk).push_str(", world");
    ///
    /// assert_eq!(pool.get(&chunk), "Hello, world");
    /// # pool.deallocate(chunk);
    /// ```
    #[must_use]
    pub fn get_mut(&mut self, chunk: &Chunk<T>) -> &mut T {
        self.assert_issued_here(chunk);

        let (block_index, index_in_block) = self.coordinates(chunk.index());

        self.blocks
            .get_mut(block_index)
            .map(|block| block.value_mut(index_in_block))
            .expect("a chunk issued by this pool always belongs to one of its blocks")
    }

    /// Returns a chunk to the pool, dropping the value stored in it.
    ///
    /// The chunk becomes the next one handed out by [`allocate()`][Self::allocate].
    /// No block is ever released by this.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by a different pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<String>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let chunk = pool.allocate("temporary".to_string()).unwrap();
    /// let address = chunk.ptr();
    ///
    /// pool.deallocate(chunk);
    ///
    /// // The released chunk is reused first.
    /// let chunk = pool.allocate("again".to_string()).unwrap();
    /// assert_eq!(chunk.ptr(), address);
    /// # pool.deallocate(chunk);
    /// ```
    pub fn deallocate(&mut self, chunk: Chunk<T>) {
        // The value is dropped after the pool has been updated, so a panicking destructor
        // cannot leave the pool inconsistent.
        drop(self.release(chunk));
    }

    /// Returns a chunk to the pool, moving the stored value out to the caller.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by a different pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<String>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let chunk = pool.allocate("kept".to_string()).unwrap();
    /// let value = pool.take(chunk);
    ///
    /// assert_eq!(value, "kept");
    /// assert!(pool.is_empty());
    /// ```
    #[must_use]
    pub fn take(&mut self, chunk: Chunk<T>) -> T {
        self.release(chunk)
    }

    fn assert_issued_here(&self, chunk: &Chunk<T>) {
        assert!(
            chunk.pool_id() == self.pool_id,
            "attempted to use a chunk from pool {} with pool {} of {}",
            chunk.pool_id(),
            self.pool_id,
            type_name::<T>()
        );
    }

    fn release(&mut self, chunk: Chunk<T>) -> T {
        self.assert_issued_here(&chunk);

        let index = chunk.index();
        let address = chunk.ptr().cast();

        let (block_index, index_in_block) = self.coordinates(index);
        let next_free_index = self.free_list_head;

        let block = self
            .blocks
            .get_mut(block_index)
            .expect("a chunk issued by this pool always belongs to one of its blocks");

        let value = block.vacate(index_in_block, next_free_index);

        self.free_list_head = Some(index);

        self.length = self
            .length
            .checked_sub(1)
            .expect("the chunk was allocated so length must be non-zero");

        self.diagnostics
            .chunk_deallocated(self.pool_id, index, address);

        value
    }

    /// Creates the next block and threads its chunks onto the (empty) free list, returning the
    /// index of the new free list head.
    fn add_block(&mut self) -> Result<usize> {
        debug_assert!(
            self.free_list_head.is_none(),
            "a new block must only be created once all existing chunks are allocated"
        );

        let block_index = self.blocks.len();

        if block_index >= self.max_blocks.get() {
            self.diagnostics.exhausted(self.pool_id, self.max_blocks.get());

            return Err(Error::Exhausted {
                chunks_per_block: self.chunks_per_block.get(),
                max_blocks: self.max_blocks.get(),
            });
        }

        let block = Block::new(block_index, self.chunks_per_block)?;

        self.diagnostics.block_allocated(
            self.pool_id,
            block_index,
            block.base_address(),
            block.size_in_bytes(),
        );

        let head = block.first_chunk_index();

        // Cannot reallocate because the registry was reserved for `max_blocks` entries.
        self.blocks.push(block);
        self.free_list_head = Some(head);

        Ok(head)
    }

    /// Splits a flat chunk index into the index of its block and its index within the block.
    #[allow(
        clippy::integer_division,
        clippy::modulo_arithmetic,
        reason = "dividing by a non-zero chunk count is exactly what we want here"
    )]
    fn coordinates(&self, index: usize) -> (usize, usize) {
        (index / self.chunks_per_block, index % self.chunks_per_block)
    }

    /// Verifies that the free list and the allocation count agree with the blocks.
    ///
    /// # Panics
    ///
    /// Panics if any inconsistency is found.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self) {
        let capacity = self.capacity();

        let mut vacant_count: usize = 0;
        let mut cursor = self.free_list_head;

        while let Some(index) = cursor {
            assert!(
                index < capacity,
                "free list links chunk {index} beyond the capacity {capacity} of pool of {}",
                type_name::<T>()
            );

            vacant_count = vacant_count
                .checked_add(1)
                .expect("guarded by the cycle check below");

            assert!(
                vacant_count <= capacity,
                "free list of pool of {} contains a cycle",
                type_name::<T>()
            );

            let (block_index, index_in_block) = self.coordinates(index);

            let block = self
                .blocks
                .get(block_index)
                .expect("guarded by the capacity check above");

            cursor = block.free_link(index_in_block).unwrap_or_else(|| {
                panic!(
                    "free list links allocated chunk {index} in pool of {}",
                    type_name::<T>()
                )
            });
        }

        let allocated_count: usize = self.blocks.iter().map(Block::len).sum();

        assert!(
            allocated_count == self.length,
            "self.length {} does not match the observed allocated count {} in pool of {}",
            self.length,
            allocated_count,
            type_name::<T>()
        );

        assert!(
            vacant_count.checked_add(self.length) == Some(capacity),
            "{vacant_count} vacant and {} allocated chunks do not add up to capacity {capacity} in pool of {}",
            self.length,
            type_name::<T>()
        );
    }
}

impl<T> Drop for BlockPool<T> {
    fn drop(&mut self) {
        let was_empty = self.is_empty();

        if self.drop_policy == DropPolicy::DropItems {
            for block in &mut self.blocks {
                block.drop_values();
            }
        }

        let pool_id = self.pool_id;
        let diagnostics = self.diagnostics;

        // Blocks are released in the order they were created. The registry itself is released
        // afterwards, when the field is dropped.
        for (block_index, block) in self.blocks.drain(..).enumerate() {
            diagnostics.block_released(pool_id, block_index, block.base_address());
            drop(block);
        }

        // We do this check at the end so we clean up the memory first.
        //
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if self.drop_policy == DropPolicy::MustNotHaveItems && !thread::panicking() {
            assert!(
                was_empty,
                "dropped a pool of {} with allocated chunks under a policy that says it must be empty when dropped",
                type_name::<T>()
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::items_after_statements,
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashSet;
    use std::ptr::NonNull;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockPool<u32>: Send);
    assert_not_impl_any!(BlockPool<u32>: Sync);
    assert_not_impl_any!(BlockPool<Rc<u32>>: Send);

    fn nz(value: usize) -> NonZero<usize> {
        NonZero::new(value).unwrap()
    }

    /// Example of a small object that a simulation might churn through.
    #[derive(Debug, PartialEq)]
    struct Item {
        x: i32,
        y: i32,
        speed: f64,
    }

    fn item(n: i32) -> Item {
        Item {
            x: n,
            y: n,
            speed: 0.5,
        }
    }

    #[test]
    fn smoke_test() {
        let mut pool = BlockPool::<u32>::new(nz(3), nz(2));

        assert!(pool.is_empty());
        assert_eq!(pool.block_count(), 0);
        assert_eq!(pool.capacity(), 0);

        let a = pool.allocate(42).unwrap();
        let b = pool.allocate(43).unwrap();
        let c = pool.allocate(44).unwrap();

        assert_eq!(*pool.get(&a), 42);
        assert_eq!(*pool.get(&b), 43);
        assert_eq!(*pool.get(&c), 44);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.block_count(), 1);

        pool.deallocate(b);

        let d = pool.allocate(45).unwrap();

        assert_eq!(*pool.get(&a), 42);
        assert_eq!(*pool.get(&c), 44);
        assert_eq!(*pool.get(&d), 45);
        assert_eq!(pool.block_count(), 1);

        pool.integrity_check();

        pool.deallocate(a);
        pool.deallocate(c);
        pool.deallocate(d);

        assert!(pool.is_empty());
        pool.integrity_check();
    }

    #[test]
    fn sixteen_allocations_fill_two_blocks() {
        let mut pool = BlockPool::<Item>::new(nz(8), nz(2));
        let mut chunks = Vec::new();

        for n in 0..16 {
            chunks.push(pool.allocate(item(n)).unwrap());

            // The second block is only created by the 9th allocation.
            let expected_blocks = if n < 8 { 1 } else { 2 };
            assert_eq!(pool.block_count(), expected_blocks);
        }

        assert_eq!(pool.len(), 16);
        assert_eq!(pool.capacity(), 16);
        assert!(pool.is_exhausted());

        for (n, chunk) in (0..).zip(&chunks) {
            assert_eq!(*pool.get(chunk), item(n));
        }

        for chunk in chunks {
            pool.deallocate(chunk);
        }
    }

    #[test]
    fn allocation_beyond_max_capacity_is_exhausted() {
        let mut pool = BlockPool::<Item>::new(nz(8), nz(2));

        let chunks = (0..16)
            .map(|n| pool.allocate(item(n)).unwrap())
            .collect::<Vec<_>>();

        let result = pool.allocate(item(16));
        assert!(matches!(
            result,
            Err(Error::Exhausted {
                chunks_per_block: 8,
                max_blocks: 2
            })
        ));

        // Exhaustion is not permanent damage - the pool is still consistent.
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.len(), 16);
        pool.integrity_check();

        for chunk in chunks {
            pool.deallocate(chunk);
        }
    }

    #[test]
    fn released_chunk_is_reused_first() {
        let mut pool = BlockPool::<Item>::new(nz(8), nz(2));

        let mut chunks = (0..16)
            .map(|n| pool.allocate(item(n)).unwrap())
            .map(Some)
            .collect::<Vec<_>>();

        let fifth = chunks[5].take().unwrap();
        let fifth_address = fifth.ptr();
        let fifth_index = fifth.index();
        pool.deallocate(fifth);

        let reused = pool.allocate(item(100)).unwrap();

        assert_eq!(reused.ptr(), fifth_address);
        assert_eq!(reused.index(), fifth_index);
        assert_eq!(*pool.get(&reused), item(100));
        assert_eq!(pool.block_count(), 2);

        pool.deallocate(reused);
        for chunk in chunks.into_iter().flatten() {
            pool.deallocate(chunk);
        }
    }

    #[test]
    fn single_chunk_pool() {
        let mut pool = BlockPool::<Item>::new(nz(1), nz(1));

        let first = pool.allocate(item(1)).unwrap();
        let first_address = first.ptr();
        pool.deallocate(first);

        let second = pool.allocate(item(2)).unwrap();
        assert_eq!(second.ptr(), first_address);

        assert!(matches!(
            pool.allocate(item(3)),
            Err(Error::Exhausted { .. })
        ));

        pool.deallocate(second);
    }

    #[test]
    fn released_chunks_are_reused_in_lifo_order() {
        let mut pool = BlockPool::<u32>::new(nz(4), nz(1));

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        let c = pool.allocate(3).unwrap();

        let a_index = a.index();
        let c_index = c.index();

        pool.deallocate(a);
        pool.deallocate(c);

        let d = pool.allocate(4).unwrap();
        let e = pool.allocate(5).unwrap();

        assert_eq!(d.index(), c_index);
        assert_eq!(e.index(), a_index);

        pool.deallocate(b);
        pool.deallocate(d);
        pool.deallocate(e);
    }

    #[test]
    fn fill_first_block_before_allocating_second() {
        let mut pool = BlockPool::<u32>::new(nz(4), nz(3));

        let chunks = (0..4).map(|n| pool.allocate(n).unwrap()).collect::<Vec<_>>();

        assert_eq!(pool.block_count(), 1);
        assert_eq!(
            chunks.iter().map(Chunk::index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        let fifth = pool.allocate(4).unwrap();
        assert_eq!(pool.block_count(), 2);
        assert_eq!(fifth.index(), 4);

        pool.deallocate(fifth);
        for chunk in chunks {
            pool.deallocate(chunk);
        }
    }

    #[test]
    fn fill_hole_before_allocating_new_block() {
        let mut pool = BlockPool::<u32>::new(nz(2), nz(2));

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        pool.deallocate(a);

        let c = pool.allocate(3).unwrap();
        assert_eq!(pool.block_count(), 1);
        assert_eq!(c.index(), 0);

        pool.deallocate(b);
        pool.deallocate(c);
    }

    #[test]
    fn live_chunks_never_alias() {
        let mut pool = BlockPool::<u64>::new(nz(5), nz(4));

        let mut chunks = Vec::new();
        let mut addresses = HashSet::new();

        // Interleave allocation and release to exercise reuse across blocks.
        for round in 0_u64..20 {
            chunks.push(pool.allocate(round).unwrap());

            if round % 3 == 0 {
                let chunk = chunks.swap_remove(0);
                pool.deallocate(chunk);
            }
        }

        for chunk in &chunks {
            assert!(addresses.insert(chunk.ptr()));
        }

        let indexes = chunks.iter().map(Chunk::index).collect::<HashSet<_>>();
        assert_eq!(indexes.len(), chunks.len());

        pool.integrity_check();

        for chunk in chunks {
            pool.deallocate(chunk);
        }
    }

    #[test]
    fn churn_never_exceeds_max_blocks() {
        let mut pool = BlockPool::<u32>::new(nz(3), nz(2));

        for round in 0..10 {
            let chunks = (0..pool.max_capacity())
                .map(|n| pool.allocate(u32::try_from(n).unwrap() + round).unwrap())
                .collect::<Vec<_>>();

            assert!(pool.is_exhausted());
            assert_eq!(pool.block_count(), 2);

            for chunk in chunks.into_iter().rev() {
                pool.deallocate(chunk);
            }

            assert_eq!(pool.block_count(), 2);
            assert!(pool.is_empty());
            assert!(!pool.is_exhausted());
        }

        pool.integrity_check();
    }

    #[test]
    fn release_then_allocate_does_not_add_block() {
        let mut pool = BlockPool::<u32>::new(nz(2), nz(4));

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        assert_eq!(pool.block_count(), 1);

        pool.deallocate(b);
        let c = pool.allocate(3).unwrap();
        assert_eq!(pool.block_count(), 1);

        pool.deallocate(a);
        pool.deallocate(c);
    }

    #[test]
    fn take_returns_value() {
        let mut pool = BlockPool::<String>::new(nz(2), nz(1));

        let chunk = pool.allocate("hello".to_string()).unwrap();
        assert_eq!(pool.take(chunk), "hello");
        assert!(pool.is_empty());
    }

    #[test]
    fn allocate_with_is_not_called_when_exhausted() {
        let mut pool = BlockPool::<u32>::new(nz(1), nz(1));
        let first = pool.allocate(1).unwrap();

        let called = Cell::new(false);
        let result = pool.allocate_with(|| {
            called.set(true);
            2
        });

        assert!(matches!(result, Err(Error::Exhausted { .. })));
        assert!(!called.get());

        pool.deallocate(first);
    }

    #[test]
    fn panic_in_allocate_with_leaves_pool_consistent() {
        let mut pool = BlockPool::<u32>::new(nz(2), nz(1));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            _ = pool.allocate_with(|| panic!("constructor failed"));
        }));
        assert!(result.is_err());

        assert!(pool.is_empty());
        pool.integrity_check();

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        assert_eq!(pool.block_count(), 1);

        pool.deallocate(a);
        pool.deallocate(b);
    }

    #[test]
    fn deallocate_drops_value() {
        let dropped = Rc::new(Cell::new(false));

        struct Droppable {
            dropped: Rc<Cell<bool>>,
        }

        impl Drop for Droppable {
            fn drop(&mut self) {
                self.dropped.set(true);
            }
        }

        let mut pool = BlockPool::<Droppable>::new(nz(2), nz(1));
        let chunk = pool
            .allocate(Droppable {
                dropped: Rc::clone(&dropped),
            })
            .unwrap();

        assert!(!dropped.get());
        pool.deallocate(chunk);
        assert!(dropped.get());
    }

    #[test]
    #[should_panic]
    fn deallocate_to_foreign_pool_panics() {
        let mut pool_a = BlockPool::<u32>::new(nz(2), nz(1));
        let mut pool_b = BlockPool::<u32>::new(nz(2), nz(1));

        let chunk = pool_a.allocate(1).unwrap();
        pool_b.deallocate(chunk);
    }

    #[test]
    fn get_mut_modifies_value_in_place() {
        let mut pool = BlockPool::<Item>::new(nz(4), nz(1));

        let a = pool.allocate(item(1)).unwrap();
        let b = pool.allocate(item(2)).unwrap();

        pool.get_mut(&a).x = 10;
        pool.get_mut(&b).speed = 2.0;

        assert_eq!(pool.get(&a).x, 10);
        assert_eq!(pool.get(&a).y, 1);
        assert_eq!(pool.get(&b).x, 2);
        assert!(pool.get(&b).speed > 1.0);

        assert_eq!(pool.take(a).x, 10);
        pool.deallocate(b);
    }

    #[test]
    #[should_panic]
    fn get_with_foreign_chunk_panics() {
        let mut pool_a = BlockPool::<u64>::new(nz(1), nz(1));
        let pool_b = BlockPool::<u64>::new(nz(1), nz(1));

        let chunk = pool_a.allocate(7).unwrap();
        _ = pool_b.get(&chunk);
    }

    #[test]
    #[should_panic]
    fn get_mut_with_foreign_chunk_panics() {
        let mut pool_a = BlockPool::<u64>::new(nz(1), nz(1));
        let mut pool_b = BlockPool::<u64>::new(nz(1), nz(1));

        let chunk = pool_a.allocate(7).unwrap();
        *pool_b.get_mut(&chunk) = 8;
    }

    #[test]
    #[should_panic]
    fn chunk_of_dropped_pool_is_rejected_by_new_pool() {
        let mut old_pool = BlockPool::<u64>::new(nz(1), nz(1));
        let chunk = old_pool.allocate(7).unwrap();
        drop(old_pool);

        // The new pool may reuse the memory, but not the identity of the old one.
        let mut new_pool = BlockPool::<u64>::new(nz(1), nz(1));
        let _own = new_pool.allocate(8).unwrap();

        _ = new_pool.get(&chunk);
    }

    #[test]
    fn zero_sized_type() {
        let mut pool = BlockPool::<()>::new(nz(2), nz(1));

        assert_eq!(pool.chunk_size(), 0);

        let a = pool.allocate(()).unwrap();
        let b = pool.allocate(()).unwrap();
        assert_ne!(a.index(), b.index());
        assert!(pool.allocate(()).is_err());

        pool.deallocate(a);
        pool.deallocate(b);
    }

    #[test]
    fn accessors_report_configuration() {
        let pool = BlockPool::<Item>::new(nz(8), nz(2));

        assert_eq!(pool.chunk_size(), size_of::<Item>());
        assert_eq!(pool.chunks_per_block(), 8);
        assert_eq!(pool.max_blocks(), 2);
        assert_eq!(pool.max_capacity(), 16);
        assert!(!pool.is_exhausted());
    }

    #[test]
    fn out_of_band_access() {
        let mut pool = BlockPool::<u32>::new(nz(4), nz(1));

        let chunk = pool.allocate(1).unwrap();
        let ptr: NonNull<u32> = chunk.ptr();

        // Other pool operations do not invalidate the pointer.
        let other = pool.allocate(2).unwrap();
        unsafe {
            *ptr.as_ptr() = 10;
        }
        pool.deallocate(other);

        assert_eq!(*pool.get(&chunk), 10);
        pool.deallocate(chunk);
    }

    #[test]
    fn in_refcell_works_fine() {
        let pool = RefCell::new(BlockPool::<u32>::new(nz(2), nz(2)));

        let a = pool.borrow_mut().allocate(1).unwrap();
        let b = pool.borrow_mut().allocate(2).unwrap();

        assert_eq!(pool.borrow().len(), 2);

        pool.borrow_mut().deallocate(a);
        pool.borrow_mut().deallocate(b);

        assert!(pool.borrow().is_empty());
    }

    #[test]
    fn multithreaded_via_mutex() {
        let pool = Arc::new(Mutex::new(BlockPool::<u32>::new(nz(4), nz(2))));

        let a = pool.lock().unwrap().allocate(42).unwrap();
        let b = pool.lock().unwrap().allocate(43).unwrap();

        let pool_clone = Arc::clone(&pool);
        std::thread::spawn(move || {
            let mut pool = pool_clone.lock().unwrap();

            assert_eq!(*pool.get(&b), 43);
            pool.deallocate(b);

            let c = pool.allocate(44).unwrap();
            assert_eq!(*pool.get(&c), 44);
            pool.deallocate(c);
        })
        .join()
        .unwrap();

        let mut pool = pool.lock().unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(*pool.get(&a), 42);
        pool.deallocate(a);
    }

    #[test]
    fn abandoned_chunks_are_not_dropped_by_default() {
        let dropped = Rc::new(Cell::new(false));

        struct Droppable {
            dropped: Rc<Cell<bool>>,
        }

        impl Drop for Droppable {
            fn drop(&mut self) {
                self.dropped.set(true);
            }
        }

        let mut pool = BlockPool::<Droppable>::new(nz(2), nz(1));
        let chunk = pool
            .allocate(Droppable {
                dropped: Rc::clone(&dropped),
            })
            .unwrap();

        drop(pool);
        drop(chunk);

        assert!(!dropped.get());
    }

    #[test]
    fn drop_items_policy_drops_remaining_values() {
        let dropped = Rc::new(Cell::new(0_usize));

        struct Droppable {
            dropped: Rc<Cell<usize>>,
        }

        impl Drop for Droppable {
            fn drop(&mut self) {
                self.dropped.set(self.dropped.get() + 1);
            }
        }

        let mut pool = BlockPool::<Droppable>::builder()
            .chunks_per_block(nz(2))
            .max_blocks(nz(2))
            .drop_policy(DropPolicy::DropItems)
            .build();

        let chunks = (0..3)
            .map(|_| {
                pool.allocate(Droppable {
                    dropped: Rc::clone(&dropped),
                })
                .unwrap()
            })
            .collect::<Vec<_>>();

        drop(pool);
        drop(chunks);

        assert_eq!(dropped.get(), 3);
    }

    #[test]
    #[should_panic]
    fn must_not_have_items_policy_panics_when_not_empty() {
        let mut pool = BlockPool::<u32>::builder()
            .max_blocks(nz(1))
            .drop_policy(DropPolicy::MustNotHaveItems)
            .build();

        std::mem::forget(pool.allocate(1).unwrap());
    }

    #[test]
    fn must_not_have_items_policy_accepts_empty_pool() {
        let mut pool = BlockPool::<u32>::builder()
            .max_blocks(nz(1))
            .drop_policy(DropPolicy::MustNotHaveItems)
            .build();

        let chunk = pool.allocate(1).unwrap();
        pool.deallocate(chunk);

        drop(pool);
    }

    #[test]
    fn verbose_diagnostics_do_not_change_behavior() {
        let mut pool = BlockPool::<u32>::builder()
            .chunks_per_block(nz(2))
            .max_blocks(nz(1))
            .diagnostics(Diagnostics::Verbose)
            .build();

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        assert!(pool.allocate(3).is_err());

        pool.deallocate(a);
        pool.deallocate(b);
        pool.integrity_check();
    }

    #[test]
    fn pool_ids_are_unique() {
        let a = BlockPool::<u32>::new(nz(1), nz(1));
        let b = BlockPool::<u32>::new(nz(1), nz(1));

        assert_ne!(a.pool_id, b.pool_id);
    }
}
