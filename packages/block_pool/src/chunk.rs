use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;

/// Exclusive handle to a value stored in a chunk of a [`BlockPool`].
///
/// Returned by [`BlockPool::allocate()`] and [`BlockPool::allocate_with()`]. The handle does not
/// implement [`Copy`] or [`Clone`] and is consumed when the chunk is returned to the pool via
/// [`BlockPool::deallocate()`] or [`BlockPool::take()`], so releasing the same chunk twice is
/// rejected by the compiler.
///
/// The handle does not borrow the pool, which allows many chunks to be held at the same time
/// while the pool keeps serving allocations. The value is reached through the pool that issued
/// the handle, via [`BlockPool::get()`] and [`BlockPool::get_mut()`], so the value can only be
/// accessed while the pool is alive. The value stays at the same address until the chunk is
/// returned to the pool.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use block_pool::BlockPool;
///
/// let mut pool = BlockPool::<String>::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap());
///
/// let greeting = pool.allocate("Hello".to_string()).unwrap();
/// pool.get_mut(&greeting).push_str(", world");
/// assert_eq!(pool.get(&greeting), "Hello, world");
///
/// pool.deallocate(greeting);
/// // `greeting` has been moved and cannot be released a second time.
/// ```
///
/// The handle itself does not dereference to the value:
///
/// ```compile_fail
/// use std::num::NonZero;
///
/// use block_pool::BlockPool;
///
/// let mut pool = BlockPool::<u64>::new(NonZero::new(1).unwrap(), NonZero::new(1).unwrap());
/// let chunk = pool.allocate(7).unwrap();
/// drop(pool);
///
/// let value: u64 = *chunk;
/// ```
///
/// [`BlockPool`]: crate::BlockPool
/// [`BlockPool::allocate()`]: crate::BlockPool::allocate
/// [`BlockPool::allocate_with()`]: crate::BlockPool::allocate_with
/// [`BlockPool::deallocate()`]: crate::BlockPool::deallocate
/// [`BlockPool::take()`]: crate::BlockPool::take
/// [`BlockPool::get()`]: crate::BlockPool::get
/// [`BlockPool::get_mut()`]: crate::BlockPool::get_mut
pub struct Chunk<T> {
    /// Ensures this handle can only be returned to the pool it came from.
    pool_id: u64,

    /// Flat index of the chunk across all blocks of the pool.
    index: usize,

    ptr: NonNull<T>,
}

impl<T> Chunk<T> {
    #[must_use]
    pub(crate) fn new(pool_id: u64, index: usize, ptr: NonNull<T>) -> Self {
        Self {
            pool_id,
            index,
            ptr,
        }
    }

    #[must_use]
    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// The index of the chunk within its pool.
    ///
    /// Chunks are numbered consecutively across blocks: chunk `i` of block `b` has index
    /// `b * chunks_per_block + i`. Indexes are reused after a chunk is released.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns a pointer to the stored value.
    ///
    /// Obtaining the pointer is safe but dereferencing it is not: the pointer is only valid
    /// while the pool is alive and the chunk has not been returned to it. While a reference
    /// obtained from [`BlockPool::get_mut()`][crate::BlockPool::get_mut] is alive, the pointer
    /// must not be used.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::<u64>::new(NonZero::new(2).unwrap(), NonZero::new(1).unwrap());
    ///
    /// let chunk = pool.allocate(42).unwrap();
    /// let ptr = chunk.ptr();
    ///
    /// // SAFETY: The chunk has not been returned to the pool and no other reference exists.
    /// assert_eq!(unsafe { *ptr.as_ref() }, 42);
    /// # pool.deallocate(chunk);
    /// ```
    #[must_use]
    #[inline]
    pub fn ptr(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T> fmt::Debug for Chunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("type_name", &type_name::<T>())
            .field("pool_id", &self.pool_id)
            .field("index", &self.index)
            .field("ptr", &self.ptr)
            .finish()
    }
}

// SAFETY: The handle only grants access to the value through the pool that issued it, and the
// pool follows the usual rules for the values it owns. The raw pointer can only be used in
// unsafe code, which takes on the obligations itself.
unsafe impl<T: Send> Send for Chunk<T> {}

// SAFETY: A shared handle exposes nothing but its index, pool ID and raw pointer.
unsafe impl<T: Sync> Sync for Chunk<T> {}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::num::NonZero;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::BlockPool;

    assert_impl_all!(Chunk<u32>: Send, Sync, fmt::Debug);
    assert_not_impl_any!(Chunk<u32>: Clone, Copy);
    assert_not_impl_any!(Chunk<Cell<u32>>: Sync);

    fn pool<T>() -> BlockPool<T> {
        BlockPool::new(NonZero::new(4).unwrap(), NonZero::new(1).unwrap())
    }

    #[test]
    fn ptr_points_at_stored_value() {
        let mut pool = pool::<u32>();

        let chunk = pool.allocate(7).unwrap();
        assert_eq!(chunk.ptr().as_ptr().cast_const(), &raw const *pool.get(&chunk));

        // SAFETY: The pool is alive, the chunk is allocated and no reference to it exists.
        assert_eq!(unsafe { *chunk.ptr().as_ref() }, 7);

        pool.deallocate(chunk);
    }

    #[test]
    fn debug_output_names_fields() {
        let mut pool = pool::<u32>();

        let chunk = pool.allocate(7).unwrap();
        let debug = format!("{chunk:?}");

        assert!(debug.contains("Chunk"));
        assert!(debug.contains("index: 0"));

        pool.deallocate(chunk);
    }
}
