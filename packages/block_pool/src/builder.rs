use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{BlockPool, Diagnostics, DropPolicy};

/// Number of chunks in each block unless configured otherwise.
const DEFAULT_CHUNKS_PER_BLOCK: NonZero<usize> = NonZero::new(128).unwrap();

/// Builder for creating an instance of [`BlockPool`].
///
/// The maximum number of blocks is mandatory, whereas other settings are optional.
/// [`BlockPool::new()`] is a shorthand for the common case of setting only the block geometry.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use block_pool::{BlockPool, Diagnostics, DropPolicy};
///
/// let pool = BlockPool::<u32>::builder()
///     .chunks_per_block(NonZero::new(64).unwrap())
///     .max_blocks(NonZero::new(16).unwrap())
///     .drop_policy(DropPolicy::MustNotHaveItems)
///     .diagnostics(Diagnostics::Verbose)
///     .build();
///
/// assert_eq!(pool.max_capacity(), 1024);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[must_use]
pub struct BlockPoolBuilder<T> {
    chunks_per_block: NonZero<usize>,
    max_blocks: Option<NonZero<usize>>,
    drop_policy: DropPolicy,
    diagnostics: Diagnostics,

    _item: PhantomData<T>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> fmt::Debug for BlockPoolBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPoolBuilder")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("chunks_per_block", &self.chunks_per_block)
            .field("max_blocks", &self.max_blocks)
            .field("drop_policy", &self.drop_policy)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

impl<T> BlockPoolBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            chunks_per_block: DEFAULT_CHUNKS_PER_BLOCK,
            max_blocks: None,
            drop_policy: DropPolicy::default(),
            diagnostics: Diagnostics::default(),
            _item: PhantomData,
            _not_sync: PhantomData,
        }
    }

    /// Sets the number of chunks in each block. Defaults to 128.
    pub fn chunks_per_block(mut self, chunks_per_block: NonZero<usize>) -> Self {
        self.chunks_per_block = chunks_per_block;
        self
    }

    /// Sets the maximum number of blocks the pool may ever create. This is mandatory.
    ///
    /// Together with [`chunks_per_block()`][Self::chunks_per_block] this bounds the number of
    /// chunks that can be allocated at the same time.
    pub fn max_blocks(mut self, max_blocks: NonZero<usize>) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how
    /// to treat chunks that are still allocated when the pool is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Sets whether the pool emits [diagnostic events][Diagnostics].
    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// No blocks are allocated until the first chunk is requested. Storage for the block
    /// registry is reserved up front.
    ///
    /// # Panics
    ///
    /// Panics if [`max_blocks()`][Self::max_blocks] has not been called, if the total number of
    /// chunks overflows `usize`, if a single block would exceed the maximum allocation size or
    /// if storage for the block registry cannot be reserved.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::<u32>::builder()
    ///     .max_blocks(NonZero::new(2).unwrap())
    ///     .build();
    ///
    /// assert_eq!(pool.block_count(), 0);
    /// ```
    #[must_use]
    pub fn build(self) -> BlockPool<T> {
        let max_blocks = self
            .max_blocks
            .expect("max_blocks must be set using .max_blocks() before calling .build()");

        BlockPool::new_inner(
            self.chunks_per_block,
            max_blocks,
            self.drop_policy,
            self.diagnostics,
        )
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockPoolBuilder<u32>: Send, fmt::Debug);
    assert_not_impl_any!(BlockPoolBuilder<u32>: Sync);

    fn nz(value: usize) -> NonZero<usize> {
        NonZero::new(value).unwrap()
    }

    #[test]
    fn new_creates_default_state() {
        let builder = BlockPoolBuilder::<u32>::new();

        assert_eq!(builder.chunks_per_block, DEFAULT_CHUNKS_PER_BLOCK);
        assert!(builder.max_blocks.is_none());
        assert_eq!(builder.drop_policy, DropPolicy::default());
        assert_eq!(builder.diagnostics, Diagnostics::Silent);
    }

    #[test]
    fn settings_are_applied() {
        let pool = BlockPoolBuilder::<u64>::new()
            .chunks_per_block(nz(8))
            .max_blocks(nz(3))
            .drop_policy(DropPolicy::DropItems)
            .diagnostics(Diagnostics::Verbose)
            .build();

        assert_eq!(pool.chunks_per_block(), 8);
        assert_eq!(pool.max_blocks(), 3);
        assert_eq!(pool.chunk_size(), size_of::<u64>());
    }

    #[test]
    fn default_chunks_per_block() {
        let pool = BlockPoolBuilder::<u64>::new().max_blocks(nz(1)).build();

        assert_eq!(pool.chunks_per_block(), 128);
    }

    #[test]
    #[should_panic]
    fn build_without_max_blocks_panics() {
        drop(BlockPoolBuilder::<u64>::new().build());
    }

    #[test]
    #[should_panic]
    fn build_with_overflowing_capacity_panics() {
        drop(
            BlockPoolBuilder::<u64>::new()
                .chunks_per_block(nz(usize::MAX))
                .max_blocks(nz(2))
                .build(),
        );
    }

    #[test]
    fn debug_output_names_item_type() {
        let builder = BlockPoolBuilder::<u16>::new().max_blocks(nz(1));

        let debug = format!("{builder:?}");
        assert!(debug.contains("u16"));
        assert!(debug.contains("max_blocks"));
    }
}
