use std::ptr::NonNull;

use tracing::{debug, trace};

/// Selects whether a pool reports its allocation activity as `tracing` events.
///
/// Diagnostics are purely observational and have no effect on allocator behavior. Each pool
/// carries its own setting, provided via [`BlockPoolBuilder::diagnostics()`][1].
///
/// When [`Verbose`][Diagnostics::Verbose], block lifecycle events are emitted at `debug` level
/// and individual chunk allocations and deallocations at `trace` level. Events are only
/// visible if the application has installed a `tracing` subscriber.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use block_pool::{BlockPool, Diagnostics};
///
/// let pool = BlockPool::<u64>::builder()
///     .max_blocks(NonZero::new(2).unwrap())
///     .diagnostics(Diagnostics::Verbose)
///     .build();
/// ```
///
/// [1]: crate::BlockPoolBuilder::diagnostics
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Diagnostics {
    /// No events are emitted. This is the default.
    #[default]
    Silent,

    /// Allocation and deallocation events are emitted.
    Verbose,
}

impl Diagnostics {
    fn is_verbose(self) -> bool {
        self == Self::Verbose
    }

    pub(crate) fn registry_reserved(self, pool_id: u64, max_blocks: usize) {
        if self.is_verbose() {
            debug!(pool_id, max_blocks, "reserved block registry");
        }
    }

    pub(crate) fn block_allocated(
        self,
        pool_id: u64,
        block_index: usize,
        address: NonNull<u8>,
        size: usize,
    ) {
        if self.is_verbose() {
            debug!(pool_id, block_index, ?address, size, "allocated block");
        }
    }

    pub(crate) fn block_released(self, pool_id: u64, block_index: usize, address: NonNull<u8>) {
        if self.is_verbose() {
            debug!(pool_id, block_index, ?address, "released block");
        }
    }

    pub(crate) fn exhausted(self, pool_id: u64, max_blocks: usize) {
        if self.is_verbose() {
            debug!(pool_id, max_blocks, "pool exhausted");
        }
    }

    pub(crate) fn chunk_allocated(self, pool_id: u64, chunk_index: usize, address: NonNull<u8>) {
        if self.is_verbose() {
            trace!(pool_id, chunk_index, ?address, "allocated chunk");
        }
    }

    pub(crate) fn chunk_deallocated(self, pool_id: u64, chunk_index: usize, address: NonNull<u8>) {
        if self.is_verbose() {
            trace!(pool_id, chunk_index, ?address, "deallocated chunk");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_silent() {
        assert_eq!(Diagnostics::default(), Diagnostics::Silent);
        assert!(!Diagnostics::Silent.is_verbose());
        assert!(Diagnostics::Verbose.is_verbose());
    }

    #[test]
    fn events_without_subscriber_are_harmless() {
        let mut value = 0_u8;
        let address = NonNull::from(&mut value);

        for diagnostics in [Diagnostics::Silent, Diagnostics::Verbose] {
            diagnostics.registry_reserved(1, 2);
            diagnostics.block_allocated(1, 0, address, 64);
            diagnostics.chunk_allocated(1, 0, address);
            diagnostics.chunk_deallocated(1, 0, address);
            diagnostics.exhausted(1, 2);
            diagnostics.block_released(1, 0, address);
        }
    }
}
