use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::NonNull;

use crate::pal::HostMemoryFacade;
use crate::{BasePoolFields, ChunkLayout, Result, engine};

/// A pool of chunks sized and aligned for values of type `T`, which the pool never initializes
/// or drops.
///
/// `T` must be [`Copy`], so forgetting a value in a chunk never skips drop logic. Entries that
/// are still acquired when the pool is cleaned or dropped are simply discarded.
///
/// Fails to compile if `T` is smaller than a pointer, since a free chunk must be able to hold a
/// link to the next free chunk.
///
/// # Example
///
/// ```rust
/// use new_zealand::nz;
/// use unordered_pool::TypedUnorderedTrivialPool;
///
/// #[derive(Clone, Copy)]
/// struct Position {
///     x: f64,
///     y: f64,
/// }
///
/// let mut pool = TypedUnorderedTrivialPool::<Position>::new(nz!(64));
///
/// let entry = pool.acquire().expect("host allocator has memory available");
///
/// // SAFETY: The chunk is sized and aligned for a Position and we have exclusive access to it.
/// unsafe { entry.write(Position { x: 1.0, y: 2.0 }) };
///
/// // SAFETY: The value was written above.
/// assert_eq!(unsafe { entry.read() }.y, 2.0);
///
/// // SAFETY: The entry was acquired from this pool and is not used after this call.
/// unsafe { pool.free(entry) };
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) if `T` is, but never thread-safe ([`Sync`]).
pub struct TypedUnorderedTrivialPool<T: Copy> {
    fields: BasePoolFields,
    host: HostMemoryFacade,

    _entries: PhantomData<T>,
}

impl<T: Copy> TypedUnorderedTrivialPool<T> {
    const CHUNK: ChunkLayout = ChunkLayout::of::<T>();

    /// Creates an empty pool that allocates pages of `page_capacity` chunks.
    ///
    /// # Panics
    ///
    /// Panics if a page would not fit in the address space.
    #[must_use]
    pub fn new(page_capacity: NonZero<u32>) -> Self {
        Self::with_host(page_capacity, HostMemoryFacade::real())
    }

    #[must_use]
    pub(crate) fn with_host(page_capacity: NonZero<u32>, host: HostMemoryFacade) -> Self {
        Self {
            fields: BasePoolFields::for_empty_pool(page_capacity, Self::CHUNK),
            host,
            _entries: PhantomData,
        }
    }

    /// Takes a chunk from the pool, allocating a new page if every chunk is in use.
    ///
    /// The chunk is uninitialized. It stays valid until it is returned with
    /// [`free()`](Self::free) or the pool is cleaned or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAllocation`][crate::Error::PageAllocation] if a new page is needed
    /// and the host allocator cannot provide it. The pool is left unchanged.
    pub fn acquire(&mut self) -> Result<NonNull<T>> {
        engine::acquire(&mut self.fields, &self.host, Self::CHUNK).map(NonNull::cast)
    }

    /// Returns a chunk to the pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `entry` was returned by [`acquire()`](Self::acquire) on this
    /// pool, has not been freed since, and is not used after this call.
    pub unsafe fn free(&mut self, entry: NonNull<T>) {
        // SAFETY: Forwarding safety requirements to the caller. T is Copy, so there is nothing
        // to drop before the chunk is reused.
        unsafe {
            engine::free(&mut self.fields, Self::CHUNK, entry.cast());
        }
    }

    /// Returns every page that holds no acquired entry to the host allocator.
    pub fn shrink(&mut self) {
        engine::shrink(&mut self.fields, &self.host, Self::CHUNK);
    }

    /// Returns every page to the host allocator.
    ///
    /// Entries that are still acquired become dangling and must not be used or freed afterwards.
    pub fn clean(&mut self) {
        engine::trivial_clean(&mut self.fields, &self.host, Self::CHUNK);
    }

    /// Number of pages currently allocated by the pool.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.fields.page_count
    }

    /// Number of chunks in every page of the pool.
    #[must_use]
    pub fn page_capacity(&self) -> NonZero<u32> {
        self.fields.page_capacity
    }
}

impl<T: Copy> Drop for TypedUnorderedTrivialPool<T> {
    fn drop(&mut self) {
        self.clean();
    }
}

// SAFETY: The pool exclusively owns its pages and any T values in them. Moving the pool to
// another thread moves that ownership with it, which is sound when T is Send.
unsafe impl<T: Copy + Send> Send for TypedUnorderedTrivialPool<T> {}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl<T: Copy> fmt::Debug for TypedUnorderedTrivialPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedUnorderedTrivialPool")
            .field("entry_type", &std::any::type_name::<T>())
            .field("fields", &self.fields)
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::pal::FakeHostMemory;

    assert_impl_all!(TypedUnorderedTrivialPool<u64>: Send, Debug);
    assert_not_impl_any!(TypedUnorderedTrivialPool<u64>: Sync, Clone);
    assert_not_impl_any!(TypedUnorderedTrivialPool<*const u8>: Send, Sync);

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Triple {
        a: u64,
        b: u64,
        c: u64,
    }

    #[test]
    fn page_count_follows_acquires() {
        let mut pool = TypedUnorderedTrivialPool::<Triple>::new(nz!(32));
        assert_eq!(pool.page_count(), 0);

        for index in 0..(2 * 32 + 1) {
            _ = pool.acquire().unwrap();
            assert_eq!(pool.page_count(), 1 + index / 32);
        }

        assert_eq!(pool.page_count(), 3);
    }

    #[test]
    fn values_survive_interleaved_traffic() {
        let mut pool = TypedUnorderedTrivialPool::<Triple>::new(nz!(8));

        let kept: Vec<_> = (0..20_u64)
            .map(|index| {
                let entry = pool.acquire().unwrap();
                unsafe {
                    entry.write(Triple {
                        a: index,
                        b: index * 2,
                        c: index * 3,
                    });
                }
                entry
            })
            .collect();

        for _ in 0..4 {
            let scratch: Vec<_> = (0..13).map(|_| pool.acquire().unwrap()).collect();

            for entry in &scratch {
                unsafe { entry.write(Triple { a: 0, b: 0, c: 0 }) };
            }

            for entry in scratch {
                unsafe { pool.free(entry) };
            }
        }

        for (index, entry) in (0_u64..).zip(&kept) {
            assert_eq!(
                unsafe { entry.read() },
                Triple {
                    a: index,
                    b: index * 2,
                    c: index * 3
                }
            );
        }
    }

    #[test]
    fn entries_are_aligned_for_type() {
        #[derive(Clone, Copy)]
        #[repr(align(32))]
        struct Aligned {
            _value: [u8; 32],
        }

        let mut pool = TypedUnorderedTrivialPool::<Aligned>::new(nz!(5));

        for _ in 0..12 {
            let entry = pool.acquire().unwrap();
            assert!(entry.is_aligned());
        }
    }

    #[test]
    fn shrink_follows_scenario() {
        let mut pool = TypedUnorderedTrivialPool::<Triple>::new(nz!(32));

        let entries: Vec<_> = (0..64).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.page_count(), 2);

        pool.shrink();
        assert_eq!(pool.page_count(), 2);

        // Half of each page. The first page acquired holds entries 0..32.
        for entry in entries[..16].iter().chain(&entries[32..48]) {
            unsafe { pool.free(*entry) };
        }
        pool.shrink();
        assert_eq!(pool.page_count(), 2);

        for entry in &entries[16..32] {
            unsafe { pool.free(*entry) };
        }
        pool.shrink();
        assert_eq!(pool.page_count(), 1);

        for entry in &entries[48..] {
            unsafe { pool.free(*entry) };
        }
        pool.shrink();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn no_page_drift_under_churn() {
        let mut pool = TypedUnorderedTrivialPool::<u64>::new(nz!(16));
        let mut live = Vec::new();

        // Deterministic pseudo-random churn that never exceeds 48 live entries.
        let seed = Cell::new(0x2545_F491_u32);
        let next = || {
            let mut x = seed.get();
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            seed.set(x);
            x
        };

        for _ in 0..2000 {
            if live.len() < 48 && (live.is_empty() || next() % 2 == 0) {
                live.push(pool.acquire().unwrap());
            } else {
                let index = (next() as usize) % live.len();
                let entry = live.swap_remove(index);
                unsafe { pool.free(entry) };
            }

            assert!(pool.page_count() <= 3);
        }
    }

    #[test]
    fn drop_releases_all_pages() {
        let fake = FakeHostMemory::new();

        {
            let mut pool =
                TypedUnorderedTrivialPool::<u64>::with_host(nz!(4), HostMemoryFacade::fake(fake.clone()));

            for _ in 0..10 {
                _ = pool.acquire().unwrap();
            }

            assert_eq!(fake.live_allocations(), 3);
        }

        assert_eq!(fake.live_allocations(), 0);
    }
}
