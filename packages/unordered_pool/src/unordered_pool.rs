use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;

use scopeguard::ScopeGuard;

use crate::builder::ChunkHook;
use crate::pal::HostMemoryFacade;
use crate::{ChunkLayout, Result, UnorderedPoolBuilder, UntypedPoolFields, engine};

/// A pool of untyped chunks whose size is chosen at runtime, with a constructor that runs on
/// every acquired chunk and a destructor that runs on every chunk given back.
///
/// The destructor runs exactly once for every chunk that was constructed: either when the chunk
/// is freed, or when the pool is cleaned or dropped while the chunk is still acquired.
///
/// # Example
///
/// ```rust
/// use std::ptr::NonNull;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use unordered_pool::UnorderedPool;
///
/// let live = Arc::new(AtomicUsize::new(0));
///
/// let mut pool = UnorderedPool::builder()
///     .chunk_size(32)
///     .constructor({
///         let live = Arc::clone(&live);
///         move |_: NonNull<u8>| {
///             live.fetch_add(1, Ordering::Relaxed);
///         }
///     })
///     .destructor({
///         let live = Arc::clone(&live);
///         move |_: NonNull<u8>| {
///             live.fetch_sub(1, Ordering::Relaxed);
///         }
///     })
///     .build();
///
/// let first = pool.acquire().expect("host allocator has memory available");
/// let _second = pool.acquire().expect("host allocator has memory available");
/// assert_eq!(live.load(Ordering::Relaxed), 2);
///
/// // SAFETY: The chunk was acquired from this pool and is not used after this call.
/// unsafe { pool.free(first) };
/// assert_eq!(live.load(Ordering::Relaxed), 1);
///
/// drop(pool);
/// assert_eq!(live.load(Ordering::Relaxed), 0);
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
pub struct UnorderedPool {
    fields: UntypedPoolFields,
    constructor: ChunkHook,
    destructor: ChunkHook,
    host: HostMemoryFacade,
}

impl UnorderedPool {
    /// Creates a builder for configuring and constructing an [`UnorderedPool`].
    ///
    /// You must specify the chunk size before calling `.build()`.
    pub fn builder() -> UnorderedPoolBuilder {
        UnorderedPoolBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(
        page_capacity: NonZero<u32>,
        chunk: ChunkLayout,
        constructor: ChunkHook,
        destructor: ChunkHook,
        host: HostMemoryFacade,
    ) -> Self {
        Self {
            fields: UntypedPoolFields::for_empty_pool(page_capacity, chunk),
            constructor,
            destructor,
            host,
        }
    }

    /// Takes a chunk from the pool and runs the constructor on it.
    ///
    /// If the constructor panics, the chunk goes back to the pool and the destructor is not
    /// called for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAllocation`][crate::Error::PageAllocation] if a new page is needed
    /// and the host allocator cannot provide it. The pool is left unchanged and the constructor
    /// is not called.
    pub fn acquire(&mut self) -> Result<NonNull<u8>> {
        let chunk = engine::acquire(&mut self.fields.base, &self.host, self.fields.chunk)?;

        let fields = &mut self.fields;
        let give_back = scopeguard::guard(chunk, |chunk| {
            // SAFETY: The chunk was acquired above and never handed out, as construction did
            // not complete.
            unsafe {
                engine::free(&mut fields.base, fields.chunk, chunk);
            }
        });

        (self.constructor)(chunk);

        Ok(ScopeGuard::into_inner(give_back))
    }

    /// Runs the destructor on a chunk and returns it to the pool.
    ///
    /// The chunk returns to the pool even if the destructor panics.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `chunk` was returned by [`acquire()`](Self::acquire) on this
    /// pool, has not been freed since, and is not used after this call.
    pub unsafe fn free(&mut self, chunk: NonNull<u8>) {
        // Misuse must be caught before the destructor touches a chunk it does not own.
        engine::assert_from_pool(&self.fields.base, self.fields.chunk, chunk);

        let fields = &mut self.fields;
        let _give_back = scopeguard::guard(chunk, |chunk| {
            // SAFETY: Forwarding safety requirements to the caller. The destructor has finished
            // with the chunk by the time the guard runs.
            unsafe {
                engine::free(&mut fields.base, fields.chunk, chunk);
            }
        });

        (self.destructor)(chunk);
    }

    /// Returns every page that holds no acquired chunk to the host allocator.
    pub fn shrink(&mut self) {
        engine::shrink(&mut self.fields.base, &self.host, self.fields.chunk);
    }

    /// Runs the destructor on every chunk that is still acquired, then returns every page to
    /// the host allocator.
    ///
    /// Chunks that were still acquired become dangling and must not be used or freed afterwards.
    pub fn clean(&mut self) {
        engine::non_trivial_clean(
            &mut self.fields.base,
            &self.host,
            self.fields.chunk,
            |chunk| (self.destructor)(chunk),
        );
    }

    /// Number of pages currently allocated by the pool.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.fields.base.page_count
    }

    /// Number of chunks in every page of the pool.
    #[must_use]
    pub fn page_capacity(&self) -> NonZero<u32> {
        self.fields.base.page_capacity
    }

    /// Size in bytes of every chunk, which is also the distance between neighbouring chunks.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.fields.chunk.size()
    }
}

impl Drop for UnorderedPool {
    fn drop(&mut self) {
        self.clean();
    }
}

// SAFETY: The pool exclusively owns its pages and the hooks are Send. Moving the pool to
// another thread moves that ownership with it.
unsafe impl Send for UnorderedPool {}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl fmt::Debug for UnorderedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnorderedPool")
            .field("fields", &self.fields)
            .field("host", &self.host)
            .finish_non_exhaustive()
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
    use std::fmt::Debug;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::pal::FakeHostMemory;

    assert_impl_all!(UnorderedPool: Send, Debug);
    assert_not_impl_any!(UnorderedPool: Sync, Clone);

    #[derive(Default)]
    struct Counters {
        constructed: AtomicUsize,
        destructed: AtomicUsize,
    }

    fn counting_pool(counters: &Arc<Counters>, host: HostMemoryFacade) -> UnorderedPool {
        let on_construct = Arc::clone(counters);
        let on_destruct = Arc::clone(counters);

        UnorderedPool::builder()
            .chunk_size(24)
            .page_capacity(nz!(32))
            .constructor(move |_| {
                on_construct.constructed.fetch_add(1, Ordering::Relaxed);
            })
            .destructor(move |_| {
                on_destruct.destructed.fetch_add(1, Ordering::Relaxed);
            })
            .host(host)
            .build()
    }

    #[test]
    fn hooks_run_on_acquire_and_free() {
        let counters = Arc::new(Counters::default());
        let mut pool = counting_pool(&counters, HostMemoryFacade::real());

        let chunk = pool.acquire().unwrap();
        assert_eq!(counters.constructed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.destructed.load(Ordering::Relaxed), 0);

        unsafe { pool.free(chunk) };
        assert_eq!(counters.destructed.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn double_free_panics_before_destructor_runs() {
        let counters = Arc::new(Counters::default());
        let mut pool = counting_pool(&counters, HostMemoryFacade::real());

        let chunk = pool.acquire().unwrap();
        unsafe { pool.free(chunk) };

        let result = catch_unwind(AssertUnwindSafe(|| unsafe { pool.free(chunk) }));

        assert!(result.is_err());
        assert_eq!(counters.destructed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn constructor_sees_chunk_before_caller() {
        let mut pool = UnorderedPool::builder()
            .chunk_size(16)
            .constructor(|chunk| unsafe { chunk.cast::<[u64; 2]>().write_unaligned([1, 2]) })
            .build();

        let chunk = pool.acquire().unwrap();
        assert_eq!(unsafe { chunk.cast::<[u64; 2]>().read_unaligned() }, [1, 2]);
    }

    #[test]
    fn destructor_receives_freed_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);

        let mut pool = UnorderedPool::builder()
            .chunk_size(16)
            .destructor(move |chunk| recorder.lock().unwrap().push(chunk.addr()))
            .build();

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();

        unsafe { pool.free(second) };
        unsafe { pool.free(first) };

        assert_eq!(*seen.lock().unwrap(), vec![second.addr(), first.addr()]);
    }

    #[test]
    fn clean_destructs_each_live_chunk_once() {
        let counters = Arc::new(Counters::default());
        let fake = FakeHostMemory::new();
        let mut pool = counting_pool(&counters, HostMemoryFacade::fake(fake.clone()));

        let chunks: Vec<_> = (0..70).map(|_| pool.acquire().unwrap()).collect();

        for chunk in chunks.iter().step_by(3) {
            unsafe { pool.free(*chunk) };
        }

        let freed = chunks.iter().step_by(3).count();
        assert_eq!(counters.destructed.load(Ordering::Relaxed), freed);

        pool.clean();

        assert_eq!(counters.constructed.load(Ordering::Relaxed), 70);
        assert_eq!(counters.destructed.load(Ordering::Relaxed), 70);
        assert_eq!(pool.page_count(), 0);
        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn drop_destructs_live_chunks() {
        let counters = Arc::new(Counters::default());

        {
            let mut pool = counting_pool(&counters, HostMemoryFacade::real());

            for _ in 0..5 {
                _ = pool.acquire().unwrap();
            }
        }

        assert_eq!(counters.destructed.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn panicking_constructor_returns_chunk() {
        let fail = Arc::new(AtomicBool::new(false));
        let should_fail = Arc::clone(&fail);
        let destructed = Arc::new(AtomicUsize::new(0));
        let on_destruct = Arc::clone(&destructed);

        let mut pool = UnorderedPool::builder()
            .chunk_size(16)
            .page_capacity(nz!(2))
            .constructor(move |_| {
                assert!(!should_fail.load(Ordering::Relaxed), "constructor failure");
            })
            .destructor(move |_| {
                on_destruct.fetch_add(1, Ordering::Relaxed);
            })
            .build();

        let kept = pool.acquire().unwrap();

        fail.store(true, Ordering::Relaxed);
        let result = catch_unwind(AssertUnwindSafe(|| pool.acquire()));
        assert!(result.is_err());
        fail.store(false, Ordering::Relaxed);

        // The chunk that failed construction is the next one handed out.
        let next = pool.acquire().unwrap();
        assert_eq!(pool.page_count(), 1);
        assert_ne!(next, kept);

        pool.clean();
        assert_eq!(destructed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn panicking_destructor_still_returns_chunk() {
        let fake = FakeHostMemory::new();

        let mut pool = UnorderedPool::builder()
            .chunk_size(16)
            .page_capacity(nz!(1))
            .destructor(|_| panic!("destructor failure"))
            .host(HostMemoryFacade::fake(fake.clone()))
            .build();

        let chunk = pool.acquire().unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| unsafe { pool.free(chunk) }));
        assert!(result.is_err());

        // The only page is entirely free again.
        pool.shrink();
        assert_eq!(pool.page_count(), 0);
        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn shrink_scenario_releases_free_pages() {
        let counters = Arc::new(Counters::default());
        let mut pool = counting_pool(&counters, HostMemoryFacade::real());

        let chunks: Vec<_> = (0..65).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.page_count(), 3);

        for chunk in &chunks[..64] {
            unsafe { pool.free(*chunk) };
        }

        pool.shrink();
        assert_eq!(pool.page_count(), 1);

        unsafe { pool.free(chunks[64]) };
        pool.shrink();
        assert_eq!(pool.page_count(), 0);
        assert_eq!(counters.destructed.load(Ordering::Relaxed), 65);
    }
}
