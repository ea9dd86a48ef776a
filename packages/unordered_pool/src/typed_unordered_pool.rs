use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::NonNull;

use scopeguard::ScopeGuard;

use crate::pal::HostMemoryFacade;
use crate::{BasePoolFields, ChunkLayout, DefaultLifecycle, EntryLifecycle, Result, engine};

/// A pool of values of type `T` that are created and disposed of by the lifecycle `L`.
///
/// Every acquired entry is initialized with [`L::construct()`][EntryLifecycle::construct]. Every
/// entry is passed to [`L::destruct()`][EntryLifecycle::destruct] exactly once: when it is freed,
/// or when the pool is cleaned or dropped while the entry is still acquired.
///
/// The default lifecycle creates entries with [`Default`] and drops them.
///
/// Fails to compile if `T` is smaller than a pointer, since a free chunk must be able to hold a
/// link to the next free chunk.
///
/// # Example
///
/// ```rust
/// use new_zealand::nz;
/// use unordered_pool::TypedUnorderedPool;
///
/// let mut pool = TypedUnorderedPool::<Vec<u32>>::new(nz!(16));
///
/// let mut entry = pool.acquire().expect("host allocator has memory available");
///
/// // SAFETY: The entry is live and we have exclusive access to it.
/// let values = unsafe { entry.as_mut() };
/// assert!(values.is_empty());
/// values.push(42);
///
/// // SAFETY: The entry was acquired from this pool and is not used after this call.
/// unsafe { pool.free(entry) };
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) if `T` is, but never thread-safe ([`Sync`]).
pub struct TypedUnorderedPool<T, L: EntryLifecycle<T> = DefaultLifecycle> {
    fields: BasePoolFields,
    host: HostMemoryFacade,

    _entries: PhantomData<T>,
    _lifecycle: PhantomData<fn() -> L>,
}

impl<T, L: EntryLifecycle<T>> TypedUnorderedPool<T, L> {
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
            _lifecycle: PhantomData,
        }
    }

    /// Takes a chunk from the pool and initializes it with a newly constructed entry.
    ///
    /// If the lifecycle panics while constructing the entry, the chunk goes back to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAllocation`][crate::Error::PageAllocation] if a new page is needed
    /// and the host allocator cannot provide it. The pool is left unchanged and no entry is
    /// constructed.
    pub fn acquire(&mut self) -> Result<NonNull<T>> {
        let chunk = engine::acquire(&mut self.fields, &self.host, Self::CHUNK)?;

        let fields = &mut self.fields;
        let give_back = scopeguard::guard(chunk, |chunk| {
            // SAFETY: The chunk was acquired above and never handed out, as construction did
            // not complete.
            unsafe {
                engine::free(fields, Self::CHUNK, chunk);
            }
        });

        let entry = chunk.cast::<T>();

        // SAFETY: The chunk is sized and aligned for T and nothing else references it.
        unsafe {
            entry.write(L::construct());
        }

        _ = ScopeGuard::into_inner(give_back);

        Ok(entry)
    }

    /// Destructs an entry and returns its chunk to the pool.
    ///
    /// The chunk returns to the pool even if the lifecycle panics while destructing the entry.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `entry` was returned by [`acquire()`](Self::acquire) on this
    /// pool, has not been freed since, and is not used after this call.
    pub unsafe fn free(&mut self, entry: NonNull<T>) {
        let chunk = entry.cast::<u8>();

        // Misuse must be caught before the entry is read out of a chunk it may not own.
        engine::assert_from_pool(&self.fields, Self::CHUNK, chunk);

        // SAFETY: The caller guarantees that the entry is live and owned by this pool. The chunk
        // is treated as free from here on, so the value is moved out exactly once.
        let value = unsafe { entry.read() };

        let fields = &mut self.fields;
        let _give_back = scopeguard::guard(chunk, |chunk| {
            // SAFETY: Forwarding safety requirements to the caller. The value was moved out of
            // the chunk above.
            unsafe {
                engine::free(fields, Self::CHUNK, chunk);
            }
        });

        L::destruct(value);
    }

    /// Returns every page that holds no acquired entry to the host allocator.
    pub fn shrink(&mut self) {
        engine::shrink(&mut self.fields, &self.host, Self::CHUNK);
    }

    /// Destructs every entry that is still acquired, then returns every page to the host
    /// allocator.
    ///
    /// Entries that were still acquired become dangling and must not be used or freed
    /// afterwards.
    pub fn clean(&mut self) {
        engine::non_trivial_clean(&mut self.fields, &self.host, Self::CHUNK, |chunk| {
            // SAFETY: The engine only passes chunks that hold a live entry, once each.
            L::destruct(unsafe { chunk.cast::<T>().read() });
        });
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

impl<T, L: EntryLifecycle<T>> Drop for TypedUnorderedPool<T, L> {
    fn drop(&mut self) {
        self.clean();
    }
}

// SAFETY: The pool exclusively owns its pages and the T values in them. Moving the pool to
// another thread moves that ownership with it, which is sound when T is Send. The lifecycle
// is only a type-level marker.
unsafe impl<T: Send, L: EntryLifecycle<T>> Send for TypedUnorderedPool<T, L> {}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl<T, L: EntryLifecycle<T>> fmt::Debug for TypedUnorderedPool<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedUnorderedPool")
            .field("entry_type", &std::any::type_name::<T>())
            .field("lifecycle", &std::any::type_name::<L>())
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
    use std::cell::{Cell, RefCell};
    use std::fmt::Debug;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::pal::FakeHostMemory;

    assert_impl_all!(TypedUnorderedPool<String>: Send, Debug);
    assert_not_impl_any!(TypedUnorderedPool<String>: Sync, Clone);
    assert_not_impl_any!(TypedUnorderedPool<Rc<u32>>: Send, Sync);

    thread_local! {
        static CONSTRUCTED: Cell<usize> = const { Cell::new(0) };
        static DESTRUCTED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
        static FAIL_NEXT_CONSTRUCT: Cell<bool> = const { Cell::new(false) };
    }

    /// Hands out entries numbered in construction order and records every destructed number.
    struct Numbered;

    impl EntryLifecycle<u64> for Numbered {
        fn construct() -> u64 {
            assert!(
                !FAIL_NEXT_CONSTRUCT.replace(false),
                "construction failure requested by test"
            );

            let number = CONSTRUCTED.get();
            CONSTRUCTED.set(number + 1);
            number as u64
        }

        fn destruct(entry: u64) {
            DESTRUCTED.with_borrow_mut(|destructed| destructed.push(entry));
        }
    }

    fn destructed() -> Vec<u64> {
        DESTRUCTED.with_borrow(|destructed| {
            let mut sorted = destructed.clone();
            sorted.sort_unstable();
            sorted
        })
    }

    struct DropFlag {
        dropped: Rc<Cell<usize>>,
    }

    impl Default for DropFlag {
        fn default() -> Self {
            Self {
                dropped: Rc::new(Cell::new(0)),
            }
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.dropped.set(self.dropped.get() + 1);
        }
    }

    #[test]
    fn acquire_constructs_default_value() {
        let mut pool = TypedUnorderedPool::<String>::new(nz!(32));

        let entry = pool.acquire().unwrap();
        assert_eq!(unsafe { entry.as_ref() }, "");
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn free_drops_value_exactly_once() {
        let mut pool = TypedUnorderedPool::<DropFlag>::new(nz!(32));

        let entry = pool.acquire().unwrap();
        let dropped = Rc::clone(&unsafe { entry.as_ref() }.dropped);
        assert_eq!(dropped.get(), 0);

        unsafe { pool.free(entry) };
        assert_eq!(dropped.get(), 1);

        // Reusing the chunk constructs a new value and does not touch the old one again.
        _ = pool.acquire().unwrap();
        drop(pool);
        assert_eq!(dropped.get(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn double_free_panics_before_dropping_again() {
        let mut pool = TypedUnorderedPool::<DropFlag>::new(nz!(32));

        let entry = pool.acquire().unwrap();
        let dropped = Rc::clone(&unsafe { entry.as_ref() }.dropped);

        unsafe { pool.free(entry) };
        assert_eq!(dropped.get(), 1);

        let result = catch_unwind(AssertUnwindSafe(|| unsafe { pool.free(entry) }));

        assert!(result.is_err());
        assert_eq!(dropped.get(), 1);
    }

    #[test]
    fn owned_values_are_dropped() {
        let mut pool = TypedUnorderedPool::<Vec<String>>::new(nz!(4));

        let entries: Vec<_> = (0..10)
            .map(|index| {
                let mut entry = pool.acquire().unwrap();
                unsafe { entry.as_mut() }.push(format!("entry {index}"));
                entry
            })
            .collect();

        for entry in entries.iter().take(5) {
            unsafe { pool.free(*entry) };
        }

        // The remaining entries are dropped by clean; leak checkers verify nothing is lost.
        pool.clean();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn lifecycle_pairs_construct_and_destruct() {
        let mut pool = TypedUnorderedPool::<u64, Numbered>::new(nz!(8));

        let entries: Vec<_> = (0..20).map(|_| pool.acquire().unwrap()).collect();
        let first_number = unsafe { entries[0].read() };

        for entry in entries.iter().skip(10) {
            unsafe { pool.free(*entry) };
        }

        let expected_freed: Vec<u64> = (first_number + 10..first_number + 20).collect();
        assert_eq!(destructed(), expected_freed);

        pool.clean();

        let expected_all: Vec<u64> = (first_number..first_number + 20).collect();
        assert_eq!(destructed(), expected_all);
    }

    #[test]
    fn panicking_construct_returns_chunk() {
        let mut pool = TypedUnorderedPool::<u64, Numbered>::new(nz!(2));

        let kept = pool.acquire().unwrap();

        FAIL_NEXT_CONSTRUCT.set(true);
        let result = catch_unwind(AssertUnwindSafe(|| pool.acquire()));
        assert!(result.is_err());

        let next = pool.acquire().unwrap();
        assert_ne!(next, kept);
        assert_eq!(pool.page_count(), 1);

        DESTRUCTED.with_borrow_mut(Vec::clear);
        pool.clean();

        // Only the two successfully constructed entries are destructed.
        assert_eq!(DESTRUCTED.with_borrow(Vec::len), 2);
    }

    #[test]
    fn allocation_failure_constructs_nothing() {
        let fake = FakeHostMemory::new();
        fake.set_allocation_budget(Some(0));

        let mut pool =
            TypedUnorderedPool::<u64, Numbered>::with_host(nz!(4), HostMemoryFacade::fake(fake.clone()));

        let constructed_before = CONSTRUCTED.get();
        assert!(pool.acquire().is_err());
        assert_eq!(CONSTRUCTED.get(), constructed_before);

        fake.set_allocation_budget(None);
        _ = pool.acquire().unwrap();
        assert_eq!(CONSTRUCTED.get(), constructed_before + 1);
    }

    #[test]
    fn drop_releases_all_pages() {
        let fake = FakeHostMemory::new();

        {
            let mut pool = TypedUnorderedPool::<String>::with_host(
                nz!(3),
                HostMemoryFacade::fake(fake.clone()),
            );

            for _ in 0..7 {
                _ = pool.acquire().unwrap();
            }

            assert_eq!(fake.live_allocations(), 3);
        }

        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn shrink_keeps_pages_with_live_entries() {
        let mut pool = TypedUnorderedPool::<DropFlag>::new(nz!(4));

        let entries: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();

        // One live entry on each page.
        for entry in entries[1..4].iter().chain(&entries[5..]) {
            unsafe { pool.free(*entry) };
        }

        pool.shrink();
        assert_eq!(pool.page_count(), 2);

        unsafe { pool.free(entries[0]) };
        pool.shrink();
        assert_eq!(pool.page_count(), 1);

        unsafe { pool.free(entries[4]) };
        pool.shrink();
        assert_eq!(pool.page_count(), 0);
    }
}
