use std::alloc::{Layout, alloc, dealloc};
use std::any::type_name;
use std::mem::{self, ManuallyDrop};
use std::num::NonZero;
use std::ptr::NonNull;

use crate::{Error, Result};

/// One contiguous allocation holding a fixed number of chunks. This is the unit by which a
/// [`BlockPool`][crate::BlockPool] grows.
///
/// Chunks are addressed by a flat index that is unique across the whole pool: the chunks of
/// block `b` occupy the flat index range `b * capacity .. (b + 1) * capacity`. Free list links
/// stored in vacant entries use flat indexes, so a single free list can thread through chunks
/// of any number of blocks.
///
/// # Out of band access
///
/// The block does not keep references to its entries. Callers receive raw pointers to the
/// values in occupied entries and may create references from them while the block itself is
/// borrowed for operations on other entries.
#[derive(Debug)]
pub(crate) struct Block<T> {
    first_entry_ptr: NonNull<Entry<T>>,

    capacity: NonZero<usize>,

    /// Flat index of the first chunk in this block.
    first_chunk_index: usize,

    /// Number of occupied entries.
    count: usize,
}

/// A chunk is either on the free list or owned by a caller. The variant is the liveness tag,
/// so the block never interprets a caller's value as a free list link or vice versa.
#[derive(Debug)]
enum Entry<T> {
    /// The value is dropped explicitly when the chunk is vacated, never implicitly.
    Occupied { value: ManuallyDrop<T> },

    Vacant { next_free_index: Option<usize> },
}

impl<T> Block<T> {
    /// Allocates the block with index `block_index` and threads all of its chunks into a free
    /// list, each chunk linking to the next and the last one linking to nothing. The head of
    /// this list is [`first_chunk_index()`][Self::first_chunk_index].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockAllocation`] if the system allocator cannot provide the memory.
    ///
    /// # Panics
    ///
    /// Panics if the flat chunk indexes of this block would not fit in `usize`.
    pub(crate) fn new(block_index: usize, capacity: NonZero<usize>) -> Result<Self> {
        let layout = Self::layout(capacity);

        let first_chunk_index = block_index
            .checked_mul(capacity.get())
            .expect("pool construction guarantees that all flat chunk indexes fit in usize");

        // SAFETY: The layout is valid for an array of entries and is not zero-sized because
        // every entry has at least the size of the vacant variant.
        let ptr = unsafe { alloc(layout) }.cast::<Entry<T>>();

        let Some(first_entry_ptr) = NonNull::new(ptr) else {
            return Err(Error::BlockAllocation {
                block_index,
                size: layout.size(),
            });
        };

        for index in 0..capacity.get() {
            // For the last entry this is the end of the block, so it links to nothing. Earlier
            // blocks have no vacant entries at this point, so nothing else needs linking.
            let next = index
                .checked_add(1)
                .filter(|next| *next < capacity.get())
                .map(|next| {
                    first_chunk_index
                        .checked_add(next)
                        .expect("guarded by the checked_mul above")
                });

            // SAFETY: The index is within the capacity we allocated for.
            let entry = unsafe { first_entry_ptr.add(index) };

            // SAFETY: The pointer is valid for writes and of the right type.
            unsafe {
                entry.as_ptr().write(Entry::Vacant {
                    next_free_index: next,
                });
            }
        }

        Ok(Self {
            first_entry_ptr,
            capacity,
            first_chunk_index,
            count: 0,
        })
    }

    /// Memory layout of a block with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if the block would exceed the maximum size of an allocation.
    #[must_use]
    pub(crate) fn layout(capacity: NonZero<usize>) -> Layout {
        Layout::array::<Entry<T>>(capacity.get()).unwrap_or_else(|_| {
            panic!(
                "a block of {capacity} chunks of {} exceeds the maximum allocation size",
                type_name::<T>()
            )
        })
    }

    #[must_use]
    pub(crate) fn size_in_bytes(&self) -> usize {
        Self::layout(self.capacity).size()
    }

    #[must_use]
    pub(crate) fn base_address(&self) -> NonNull<u8> {
        self.first_entry_ptr.cast()
    }

    #[must_use]
    pub(crate) fn first_chunk_index(&self) -> usize {
        self.first_chunk_index
    }

    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Only used for statistics and integrity checks.
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn entry_ptr(&self, index_in_block: usize) -> NonNull<Entry<T>> {
        assert!(
            index_in_block < self.capacity.get(),
            "chunk {index_in_block} out of bounds in block of {} chunks of {}",
            self.capacity,
            type_name::<T>()
        );

        // SAFETY: Guarded by the bounds check above.
        unsafe { self.first_entry_ptr.add(index_in_block) }
    }

    fn entry(&self, index_in_block: usize) -> &Entry<T> {
        // SAFETY: Every entry was initialized in `new()` and the pointer is in bounds.
        unsafe { self.entry_ptr(index_in_block).as_ref() }
    }

    #[expect(clippy::needless_pass_by_ref_mut, reason = "false positive")]
    fn entry_mut(&mut self, index_in_block: usize) -> &mut Entry<T> {
        let mut entry_ptr = self.entry_ptr(index_in_block);

        // SAFETY: Every entry was initialized in `new()` and the pointer is in bounds.
        unsafe { entry_ptr.as_mut() }
    }

    /// Stores `value` in a vacant chunk, returning a pointer to the stored value and the free
    /// list link that the chunk held.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is out of bounds or already occupied.
    pub(crate) fn occupy(
        &mut self,
        index_in_block: usize,
        value: T,
    ) -> (NonNull<T>, Option<usize>) {
        let entry = self.entry_mut(index_in_block);

        let previous = mem::replace(
            entry,
            Entry::Occupied {
                value: ManuallyDrop::new(value),
            },
        );

        let Entry::Vacant { next_free_index } = previous else {
            panic!(
                "chunk {index_in_block} was already occupied in block of {}",
                type_name::<T>()
            );
        };

        let ptr = match entry {
            Entry::Occupied { value } => NonNull::from(&mut **value),
            Entry::Vacant { .. } => unreachable!("we just stored an occupied entry"),
        };

        self.count = self
            .count
            .checked_add(1)
            .expect("cannot exceed capacity because the chunk was vacant");

        (ptr, next_free_index)
    }

    /// Turns an occupied chunk into a free list node linking to `next_free_index`, returning
    /// the value that was stored in it.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is out of bounds or vacant.
    pub(crate) fn vacate(&mut self, index_in_block: usize, next_free_index: Option<usize>) -> T {
        let entry = self.entry_mut(index_in_block);

        let previous = mem::replace(entry, Entry::Vacant { next_free_index });

        let Entry::Occupied { value } = previous else {
            panic!(
                "chunk {index_in_block} was vacant when released in block of {}",
                type_name::<T>()
            );
        };

        self.count = self
            .count
            .checked_sub(1)
            .expect("the chunk was occupied so count must be non-zero");

        ManuallyDrop::into_inner(value)
    }

    /// The free list link of a vacant chunk, or `None` if the chunk is occupied.
    #[must_use]
    pub(crate) fn free_link(&self, index_in_block: usize) -> Option<Option<usize>> {
        match self.entry(index_in_block) {
            Entry::Occupied { .. } => None,
            Entry::Vacant { next_free_index } => Some(*next_free_index),
        }
    }

    /// # Panics
    ///
    /// Panics if the chunk is out of bounds or vacant.
    #[must_use]
    pub(crate) fn value(&self, index_in_block: usize) -> &T {
        match self.entry(index_in_block) {
            Entry::Occupied { value } => &**value,
            Entry::Vacant { .. } => panic!(
                "chunk {index_in_block} is vacant in block of {}",
                type_name::<T>()
            ),
        }
    }

    /// # Panics
    ///
    /// Panics if the chunk is out of bounds or vacant.
    #[must_use]
    pub(crate) fn value_mut(&mut self, index_in_block: usize) -> &mut T {
        match self.entry_mut(index_in_block) {
            Entry::Occupied { value } => &mut **value,
            Entry::Vacant { .. } => panic!(
                "chunk {index_in_block} is vacant in block of {}",
                type_name::<T>()
            ),
        }
    }

    /// Drops the values of all occupied chunks, leaving them vacant and unlinked.
    pub(crate) fn drop_values(&mut self) {
        for index in 0..self.capacity.get() {
            if let Entry::Occupied { value } = self.entry_mut(index) {
                // SAFETY: The entry is overwritten right below, so the value is never used
                // or dropped again.
                unsafe { ManuallyDrop::drop(value) };

                *self.entry_mut(index) = Entry::Vacant {
                    next_free_index: None,
                };
            }
        }

        self.count = 0;
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        // Entries have no drop glue: values are wrapped in `ManuallyDrop`, so releasing the
        // memory abandons any value still stored here.
        //
        // SAFETY: The layout matches the one used for the allocation in `new()`.
        unsafe {
            dealloc(self.first_entry_ptr.as_ptr().cast(), Self::layout(self.capacity));
        }
    }
}

// SAFETY: The block owns its memory and the values in it, so it can move between threads as long
// as the values can.
unsafe impl<T: Send> Send for Block<T> {}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn nz(value: usize) -> NonZero<usize> {
        NonZero::new(value).unwrap()
    }

    #[test]
    fn new_block_is_threaded_in_order() {
        let block = Block::<u64>::new(0, nz(4)).unwrap();

        assert!(block.is_empty());
        assert_eq!(block.first_chunk_index(), 0);
        assert_eq!(block.free_link(0), Some(Some(1)));
        assert_eq!(block.free_link(1), Some(Some(2)));
        assert_eq!(block.free_link(2), Some(Some(3)));
        assert_eq!(block.free_link(3), Some(None));
    }

    #[test]
    fn later_block_uses_flat_indexes() {
        let block = Block::<u64>::new(2, nz(3)).unwrap();

        assert_eq!(block.first_chunk_index(), 6);
        assert_eq!(block.free_link(0), Some(Some(7)));
        assert_eq!(block.free_link(1), Some(Some(8)));
        assert_eq!(block.free_link(2), Some(None));
    }

    #[test]
    fn single_chunk_block_links_to_nothing() {
        let block = Block::<u8>::new(0, nz(1)).unwrap();

        assert_eq!(block.free_link(0), Some(None));
    }

    #[test]
    fn occupy_then_vacate() {
        let mut block = Block::<u32>::new(0, nz(2)).unwrap();

        let (ptr, next) = block.occupy(0, 42);
        assert_eq!(next, Some(1));
        assert_eq!(unsafe { *ptr.as_ref() }, 42);
        assert_eq!(block.len(), 1);
        assert_eq!(block.free_link(0), None);

        let value = block.vacate(0, Some(1));
        assert_eq!(value, 42);
        assert!(block.is_empty());
        assert_eq!(block.free_link(0), Some(Some(1)));
    }

    #[test]
    fn occupied_values_are_stable_and_distinct() {
        let mut block = Block::<u32>::new(0, nz(3)).unwrap();

        let (a, _) = block.occupy(0, 1);
        let (b, _) = block.occupy(1, 2);
        let (c, _) = block.occupy(2, 3);

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);

        unsafe {
            *a.as_ptr() = 10;
        }

        assert_eq!(unsafe { *a.as_ref() }, 10);
        assert_eq!(unsafe { *b.as_ref() }, 2);
        assert_eq!(unsafe { *c.as_ref() }, 3);

        _ = block.vacate(0, None);
        _ = block.vacate(1, None);
        _ = block.vacate(2, None);
    }

    #[test]
    fn value_access_reaches_occupied_chunk() {
        let mut block = Block::<String>::new(0, nz(2)).unwrap();

        _ = block.occupy(1, "abc".to_string());
        block.value_mut(1).push('d');

        assert_eq!(block.value(1), "abcd");
        assert_eq!(block.vacate(1, None), "abcd");
    }

    #[test]
    #[should_panic]
    fn value_of_vacant_chunk_panics() {
        let block = Block::<u32>::new(0, nz(2)).unwrap();

        _ = block.value(0);
    }

    #[test]
    #[should_panic]
    fn occupy_occupied_panics() {
        let mut block = Block::<u32>::new(0, nz(2)).unwrap();

        _ = block.occupy(0, 1);
        _ = block.occupy(0, 2);
    }

    #[test]
    #[should_panic]
    fn vacate_vacant_panics() {
        let mut block = Block::<u32>::new(0, nz(2)).unwrap();

        _ = block.vacate(1, None);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_panics() {
        let block = Block::<u32>::new(0, nz(2)).unwrap();

        _ = block.free_link(2);
    }

    #[test]
    fn drop_values_runs_destructors() {
        struct Droppable {
            dropped: Rc<Cell<usize>>,
        }

        impl Drop for Droppable {
            fn drop(&mut self) {
                self.dropped.set(self.dropped.get() + 1);
            }
        }

        let dropped = Rc::new(Cell::new(0));
        let mut block = Block::<Droppable>::new(0, nz(3)).unwrap();

        _ = block.occupy(
            0,
            Droppable {
                dropped: Rc::clone(&dropped),
            },
        );
        _ = block.occupy(
            2,
            Droppable {
                dropped: Rc::clone(&dropped),
            },
        );

        block.drop_values();

        assert_eq!(dropped.get(), 2);
        assert!(block.is_empty());
        assert_eq!(block.free_link(0), Some(None));
        assert_eq!(block.free_link(2), Some(None));
    }

    #[test]
    fn dropping_block_abandons_values() {
        struct Droppable {
            dropped: Rc<Cell<bool>>,
        }

        impl Drop for Droppable {
            fn drop(&mut self) {
                self.dropped.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let mut block = Block::<Droppable>::new(0, nz(1)).unwrap();

        _ = block.occupy(
            0,
            Droppable {
                dropped: Rc::clone(&dropped),
            },
        );

        drop(block);

        assert!(!dropped.get());
    }

    #[test]
    fn zero_sized_values_are_supported() {
        let mut block = Block::<()>::new(0, nz(2)).unwrap();

        let (_, next) = block.occupy(0, ());
        assert_eq!(next, Some(1));
        block.vacate(0, next);
    }

    #[test]
    fn size_covers_all_chunks() {
        let block = Block::<u64>::new(0, nz(8)).unwrap();

        assert!(block.size_in_bytes() >= 8 * size_of::<u64>());
    }
}
