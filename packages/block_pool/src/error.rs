use thiserror::Error;

/// Errors that can occur when allocating a chunk from a [`BlockPool`][crate::BlockPool].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Every permitted block has been created and every chunk in them is allocated.
    ///
    /// This is an expected condition for a bounded pool. Allocation will succeed again once
    /// a chunk is returned to the pool.
    #[error(
        "pool is exhausted: all {max_blocks} blocks of {chunks_per_block} chunks are allocated"
    )]
    Exhausted {
        /// Number of chunks in each block of the pool.
        chunks_per_block: usize,

        /// Maximum number of blocks the pool may create.
        max_blocks: usize,
    },

    /// The system allocator could not provide the memory for a new block.
    ///
    /// The block is not registered with the pool, so the pool remains usable and no chunk
    /// is ever served from the failed block.
    #[error("failed to obtain {size} bytes from the system allocator for block {block_index}")]
    BlockAllocation {
        /// Index the block would have had in the pool.
        block_index: usize,

        /// Size in bytes of the requested block.
        size: usize,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn exhausted_message_names_limits() {
        let error = Error::Exhausted {
            chunks_per_block: 8,
            max_blocks: 2,
        };

        assert_eq!(
            error.to_string(),
            "pool is exhausted: all 2 blocks of 8 chunks are allocated"
        );
    }

    #[test]
    fn block_allocation_message_names_block() {
        let error = Error::BlockAllocation {
            block_index: 3,
            size: 4096,
        };

        assert_eq!(
            error.to_string(),
            "failed to obtain 4096 bytes from the system allocator for block 3"
        );
    }
}
