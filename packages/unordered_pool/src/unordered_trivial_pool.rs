use std::num::NonZero;
use std::ptr::NonNull;

use crate::pal::HostMemoryFacade;
use crate::{ChunkLayout, Result, UnorderedTrivialPoolBuilder, UntypedPoolFields, engine};

/// A pool of untyped chunks whose size is chosen at runtime.
///
/// Chunks are handed out as raw memory. The pool never initializes or finalizes their contents,
/// so anything stored in a chunk must not need dropping.
///
/// # Example
///
/// ```rust
/// use new_zealand::nz;
/// use unordered_pool::UnorderedTrivialPool;
///
/// let mut pool = UnorderedTrivialPool::builder()
///     .chunk_size(24)
///     .page_capacity(nz!(32))
///     .build();
///
/// let chunk = pool.acquire().expect("host allocator has memory available");
///
/// // SAFETY: The chunk is 24 bytes and we have exclusive access to it.
/// unsafe { chunk.write_bytes(0xAB, 24) };
///
/// // SAFETY: The chunk was acquired from this pool and is not used after this call.
/// unsafe { pool.free(chunk) };
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
pub struct UnorderedTrivialPool {
    fields: UntypedPoolFields,
    host: HostMemoryFacade,
}

impl UnorderedTrivialPool {
    /// Creates a builder for configuring and constructing an [`UnorderedTrivialPool`].
    ///
    /// You must specify the chunk size before calling `.build()`.
    pub fn builder() -> UnorderedTrivialPoolBuilder {
        UnorderedTrivialPoolBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(
        page_capacity: NonZero<u32>,
        chunk: ChunkLayout,
        host: HostMemoryFacade,
    ) -> Self {
        Self {
            fields: UntypedPoolFields::for_empty_pool(page_capacity, chunk),
            host,
        }
    }

    /// Takes a chunk from the pool, allocating a new page if every chunk is in use.
    ///
    /// The contents of the chunk are unspecified. The chunk is aligned as configured and stays
    /// valid until it is returned with [`free()`](Self::free) or the pool is cleaned or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAllocation`][crate::Error::PageAllocation] if a new page is needed
    /// and the host allocator cannot provide it. The pool is left unchanged.
    pub fn acquire(&mut self) -> Result<NonNull<u8>> {
        engine::acquire(&mut self.fields.base, &self.host, self.fields.chunk)
    }

    /// Returns a chunk to the pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `chunk` was returned by [`acquire()`](Self::acquire) on this
    /// pool, has not been freed since, and is not used after this call.
    pub unsafe fn free(&mut self, chunk: NonNull<u8>) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            engine::free(&mut self.fields.base, self.fields.chunk, chunk);
        }
    }

    /// Returns every page that holds no acquired chunk to the host allocator.
    pub fn shrink(&mut self) {
        engine::shrink(&mut self.fields.base, &self.host, self.fields.chunk);
    }

    /// Returns every page to the host allocator.
    ///
    /// Chunks that are still acquired become dangling and must not be used or freed afterwards.
    pub fn clean(&mut self) {
        engine::trivial_clean(&mut self.fields.base, &self.host, self.fields.chunk);
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

impl Drop for UnorderedTrivialPool {
    fn drop(&mut self) {
        self.clean();
    }
}

// SAFETY: The pool exclusively owns its pages and the chunks in them hold plain bytes. Moving
// the pool to another thread moves that ownership with it.
unsafe impl Send for UnorderedTrivialPool {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Error;
    use crate::pal::FakeHostMemory;

    assert_impl_all!(UnorderedTrivialPool: Send, Debug);
    assert_not_impl_any!(UnorderedTrivialPool: Sync, Clone);

    fn pool_with_fake(fake: &FakeHostMemory) -> UnorderedTrivialPool {
        UnorderedTrivialPool::builder()
            .chunk_size(24)
            .page_capacity(nz!(32))
            .host(HostMemoryFacade::fake(fake.clone()))
            .build()
    }

    #[test]
    fn new_pool_has_no_pages() {
        let pool = UnorderedTrivialPool::builder().chunk_size(24).build();

        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.chunk_size(), 24);
        assert_eq!(pool.page_capacity(), crate::DEFAULT_PAGE_CAPACITY);
    }

    #[test]
    fn page_count_follows_acquires() {
        let fake = FakeHostMemory::new();
        let mut pool = pool_with_fake(&fake);

        for index in 0..65_u32 {
            _ = pool.acquire().unwrap();
            assert_eq!(pool.page_count(), 1 + index / 32);
        }

        assert_eq!(fake.live_allocations(), 3);
    }

    #[test]
    fn written_bytes_survive_other_traffic() {
        let mut pool = UnorderedTrivialPool::builder()
            .chunk_size(24)
            .page_capacity(nz!(4))
            .build();

        let kept = pool.acquire().unwrap();
        unsafe { kept.write_bytes(0x5A, 24) };

        for _ in 0..3 {
            let others: Vec<_> = (0..9).map(|_| pool.acquire().unwrap()).collect();

            for other in &others {
                unsafe { other.write_bytes(0xFF, 24) };
            }

            for other in others {
                unsafe { pool.free(other) };
            }

            pool.shrink();
        }

        let bytes = unsafe { std::slice::from_raw_parts(kept.as_ptr(), 24) };
        assert!(bytes.iter().all(|&byte| byte == 0x5A));
    }

    #[test]
    fn chunks_honor_configured_alignment() {
        let mut pool = UnorderedTrivialPool::builder()
            .chunk_layout(std::alloc::Layout::from_size_align(48, 64).unwrap())
            .page_capacity(nz!(3))
            .build();

        assert_eq!(pool.chunk_size(), 64);

        for _ in 0..7 {
            let chunk = pool.acquire().unwrap();
            assert_eq!(chunk.addr().get() % 64, 0);
        }
    }

    #[test]
    fn drop_releases_all_pages() {
        let fake = FakeHostMemory::new();

        {
            let mut pool = pool_with_fake(&fake);

            for _ in 0..100 {
                _ = pool.acquire().unwrap();
            }

            assert_eq!(fake.live_allocations(), 4);
        }

        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn clean_allows_reuse() {
        let fake = FakeHostMemory::new();
        let mut pool = pool_with_fake(&fake);

        _ = pool.acquire().unwrap();
        pool.clean();
        assert_eq!(pool.page_count(), 0);
        assert_eq!(fake.live_allocations(), 0);

        _ = pool.acquire().unwrap();
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let fake = FakeHostMemory::new();
        fake.set_allocation_budget(Some(0));
        let mut pool = pool_with_fake(&fake);

        assert!(matches!(
            pool.acquire(),
            Err(Error::PageAllocation { .. })
        ));
        assert_eq!(pool.page_count(), 0);

        fake.set_allocation_budget(None);
        _ = pool.acquire().unwrap();
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn pool_can_move_to_another_thread() {
        let mut pool = UnorderedTrivialPool::builder().chunk_size(16).build();
        let chunk = pool.acquire().unwrap();
        unsafe { chunk.cast::<u64>().write_unaligned(7) };

        let chunk_addr = chunk.addr();

        std::thread::spawn(move || {
            let chunk = pool
                .acquire()
                .map(|other| {
                    assert_ne!(other.addr(), chunk_addr);
                    other
                })
                .unwrap();

            unsafe { pool.free(chunk) };
            assert_eq!(pool.page_count(), 1);
        })
        .join()
        .unwrap();
    }
}
