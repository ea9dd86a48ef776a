use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;

use crate::pal::HostMemoryFacade;
use crate::{ChunkLayout, UnorderedPool, UnorderedTrivialPool};

/// Number of chunks in every page of a pool, unless configured otherwise.
#[cfg(not(miri))]
pub const DEFAULT_PAGE_CAPACITY: NonZero<u32> = nz!(128);

/// Number of chunks in every page of a pool, unless configured otherwise.
// Under Miri, we use a smaller page capacity because Miri test runtime scales by memory usage.
#[cfg(miri)]
pub const DEFAULT_PAGE_CAPACITY: NonZero<u32> = nz!(16);

/// Callback that runs on the raw chunk of an [`UnorderedPool`] entry.
pub(crate) type ChunkHook = Box<dyn FnMut(NonNull<u8>) + Send>;

/// Chunk layout for a bare chunk size, aligned as strictly as the size allows up to pointer
/// alignment.
fn chunk_layout_for_size(size: usize) -> ChunkLayout {
    // Lowest set bit, the largest power of two that divides the size.
    let align = (size & size.wrapping_neg()).clamp(1, align_of::<*mut u8>());

    let layout = Layout::from_size_align(size, align)
        .expect("a power of two not larger than the size is always a valid alignment");

    ChunkLayout::from_layout(layout)
}

/// Builder for creating an instance of [`UnorderedTrivialPool`].
///
/// The chunk size is mandatory and set with one of `.chunk_size()`, `.chunk_layout()` or
/// `.chunk_layout_of::<T>()`. The page capacity is optional and defaults to
/// [`DEFAULT_PAGE_CAPACITY`].
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use unordered_pool::UnorderedTrivialPool;
///
/// let pool = UnorderedTrivialPool::builder()
///     .chunk_size(24)
///     .page_capacity(nz!(64))
///     .build();
///
/// assert_eq!(pool.chunk_size(), 24);
/// assert_eq!(pool.page_capacity(), nz!(64));
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct UnorderedTrivialPoolBuilder {
    chunk: Option<ChunkLayout>,
    page_capacity: NonZero<u32>,
    host: HostMemoryFacade,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl UnorderedTrivialPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            chunk: None,
            page_capacity: DEFAULT_PAGE_CAPACITY,
            host: HostMemoryFacade::real(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size in bytes of every chunk of the pool.
    ///
    /// Chunks are aligned to the largest power of two that divides the size, up to pointer
    /// alignment. Use [`chunk_layout()`](Self::chunk_layout) for stricter alignment.
    ///
    /// # Panics
    ///
    /// Panics if the size is smaller than a pointer.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk = Some(chunk_layout_for_size(size));
        self
    }

    /// Sets the size and alignment of every chunk of the pool.
    ///
    /// The size is padded up to a multiple of the alignment.
    ///
    /// # Panics
    ///
    /// Panics if the padded size is smaller than a pointer.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::alloc::Layout;
    ///
    /// use unordered_pool::UnorderedTrivialPool;
    ///
    /// let layout = Layout::from_size_align(20, 16).unwrap();
    /// let pool = UnorderedTrivialPool::builder().chunk_layout(layout).build();
    ///
    /// assert_eq!(pool.chunk_size(), 32);
    /// ```
    pub fn chunk_layout(mut self, layout: Layout) -> Self {
        self.chunk = Some(ChunkLayout::from_layout(layout));
        self
    }

    /// Sets the chunk size and alignment to fit values of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is smaller than a pointer.
    pub fn chunk_layout_of<T>(self) -> Self {
        self.chunk_layout(Layout::new::<T>())
    }

    /// Sets the number of chunks in every page of the pool.
    pub fn page_capacity(mut self, page_capacity: NonZero<u32>) -> Self {
        self.page_capacity = page_capacity;
        self
    }

    #[cfg(test)]
    pub(crate) fn host(mut self, host: HostMemoryFacade) -> Self {
        self.host = host;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no chunk size has been set, or if a page would not fit in the address space.
    #[must_use]
    pub fn build(self) -> UnorderedTrivialPool {
        let chunk = self.chunk.expect(
            "chunk size must be set using .chunk_size(), .chunk_layout() or .chunk_layout_of::<T>() before calling .build()",
        );

        UnorderedTrivialPool::new_inner(self.page_capacity, chunk, self.host)
    }
}

/// Builder for creating an instance of [`UnorderedPool`].
///
/// The chunk size is mandatory and set with one of `.chunk_size()`, `.chunk_layout()` or
/// `.chunk_layout_of::<T>()`. The page capacity defaults to [`DEFAULT_PAGE_CAPACITY`]. The
/// constructor and destructor default to doing nothing.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
///
/// use unordered_pool::UnorderedPool;
///
/// let mut pool = UnorderedPool::builder()
///     .chunk_layout_of::<u64>()
///     .constructor(|chunk: NonNull<u8>| {
///         // SAFETY: The chunk is sized and aligned for a u64 and we have exclusive access.
///         unsafe { chunk.cast::<u64>().write(42) };
///     })
///     .build();
///
/// let entry = pool.acquire().expect("host allocator has memory available");
///
/// // SAFETY: The constructor initialized the chunk as a u64.
/// assert_eq!(unsafe { entry.cast::<u64>().read() }, 42);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct UnorderedPoolBuilder {
    chunk: Option<ChunkLayout>,
    page_capacity: NonZero<u32>,
    constructor: Option<ChunkHook>,
    destructor: Option<ChunkHook>,
    host: HostMemoryFacade,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl UnorderedPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            chunk: None,
            page_capacity: DEFAULT_PAGE_CAPACITY,
            constructor: None,
            destructor: None,
            host: HostMemoryFacade::real(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size in bytes of every chunk of the pool.
    ///
    /// Chunks are aligned to the largest power of two that divides the size, up to pointer
    /// alignment. Use [`chunk_layout()`](Self::chunk_layout) for stricter alignment.
    ///
    /// # Panics
    ///
    /// Panics if the size is smaller than a pointer.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk = Some(chunk_layout_for_size(size));
        self
    }

    /// Sets the size and alignment of every chunk of the pool.
    ///
    /// The size is padded up to a multiple of the alignment.
    ///
    /// # Panics
    ///
    /// Panics if the padded size is smaller than a pointer.
    pub fn chunk_layout(mut self, layout: Layout) -> Self {
        self.chunk = Some(ChunkLayout::from_layout(layout));
        self
    }

    /// Sets the chunk size and alignment to fit values of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is smaller than a pointer.
    pub fn chunk_layout_of<T>(self) -> Self {
        self.chunk_layout(Layout::new::<T>())
    }

    /// Sets the number of chunks in every page of the pool.
    pub fn page_capacity(mut self, page_capacity: NonZero<u32>) -> Self {
        self.page_capacity = page_capacity;
        self
    }

    /// Sets the callback that initializes a chunk before `acquire()` hands it out.
    ///
    /// The chunk contents are unspecified when the callback runs.
    pub fn constructor(mut self, constructor: impl FnMut(NonNull<u8>) + Send + 'static) -> Self {
        self.constructor = Some(Box::new(constructor));
        self
    }

    /// Sets the callback that runs on a chunk when it is freed, or when it is still live while
    /// the pool is cleaned or dropped.
    pub fn destructor(mut self, destructor: impl FnMut(NonNull<u8>) + Send + 'static) -> Self {
        self.destructor = Some(Box::new(destructor));
        self
    }

    #[cfg(test)]
    pub(crate) fn host(mut self, host: HostMemoryFacade) -> Self {
        self.host = host;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no chunk size has been set, or if a page would not fit in the address space.
    #[must_use]
    pub fn build(self) -> UnorderedPool {
        let chunk = self.chunk.expect(
            "chunk size must be set using .chunk_size(), .chunk_layout() or .chunk_layout_of::<T>() before calling .build()",
        );

        UnorderedPool::new_inner(
            self.page_capacity,
            chunk,
            self.constructor.unwrap_or_else(|| Box::new(|_| {})),
            self.destructor.unwrap_or_else(|| Box::new(|_| {})),
            self.host,
        )
    }
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl fmt::Debug for UnorderedPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnorderedPoolBuilder")
            .field("chunk", &self.chunk)
            .field("page_capacity", &self.page_capacity)
            .field("has_constructor", &self.constructor.is_some())
            .field("has_destructor", &self.destructor.is_some())
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::page::LINK_SIZE;

    assert_impl_all!(UnorderedTrivialPoolBuilder: Send, Debug);
    assert_not_impl_any!(UnorderedTrivialPoolBuilder: Sync);
    assert_impl_all!(UnorderedPoolBuilder: Send, Debug);
    assert_not_impl_any!(UnorderedPoolBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = UnorderedTrivialPoolBuilder::new();
        assert!(builder.chunk.is_none());
        assert_eq!(builder.page_capacity, DEFAULT_PAGE_CAPACITY);

        let builder = UnorderedPoolBuilder::new();
        assert!(builder.chunk.is_none());
        assert!(builder.constructor.is_none());
        assert!(builder.destructor.is_none());
    }

    #[test]
    fn chunk_size_derives_alignment_from_size() {
        let chunk = chunk_layout_for_size(24);
        assert_eq!(chunk.size(), 24);
        assert_eq!(chunk.align(), 8_usize.min(align_of::<*mut u8>()));

        let chunk = chunk_layout_for_size(LINK_SIZE + 1);
        assert_eq!(chunk.size(), LINK_SIZE + 1);
        assert_eq!(chunk.align(), 1);

        let chunk = chunk_layout_for_size(1024);
        assert_eq!(chunk.align(), align_of::<*mut u8>());
    }

    #[test]
    fn chunk_layout_of_sets_layout() {
        let builder = UnorderedTrivialPoolBuilder::new().chunk_layout_of::<[u32; 6]>();
        assert_eq!(
            builder.chunk,
            Some(ChunkLayout::from_layout(Layout::new::<[u32; 6]>()))
        );
    }

    #[test]
    fn page_capacity_sets_capacity() {
        let builder = UnorderedPoolBuilder::new().page_capacity(nz!(7));
        assert_eq!(builder.page_capacity, nz!(7));
    }

    #[test]
    #[should_panic]
    fn build_without_chunk_size_panics() {
        let _pool = UnorderedTrivialPoolBuilder::new().build();
    }

    #[test]
    #[should_panic]
    fn untyped_build_without_chunk_size_panics() {
        let _pool = UnorderedPoolBuilder::new().build();
    }

    #[test]
    #[should_panic]
    fn chunk_size_smaller_than_pointer_panics() {
        _ = UnorderedTrivialPoolBuilder::new().chunk_size(LINK_SIZE - 1);
    }

    #[test]
    #[should_panic]
    fn zero_chunk_size_panics() {
        _ = UnorderedPoolBuilder::new().chunk_size(0);
    }

    #[test]
    #[should_panic]
    fn chunk_layout_of_small_type_panics() {
        _ = UnorderedPoolBuilder::new().chunk_layout_of::<u16>();
    }
}
