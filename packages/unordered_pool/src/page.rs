//! Page and chunk address arithmetic, page construction and page list links.
//!
//! A page is a single block obtained from the host memory:
//!
//! ```text
//! +-----------+---------+---------+-----+---------+
//! | next page | chunk 0 | chunk 1 | ... | chunk N |
//! +-----------+---------+---------+-----+---------+
//! ```
//!
//! The header word stores the address of the next page in the pool's page list. The header is
//! padded so that chunks start at the chunk alignment. While a chunk is free, its first
//! pointer-sized word stores the address of the next free chunk (see [`crate::free_list`]).

use std::alloc::Layout;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::pal::HostMemory;
use crate::{BasePoolFields, Error, Result, free_list};

/// Size of the link words stored in page headers and free chunks.
pub(crate) const LINK_SIZE: usize = size_of::<*mut u8>();

/// Converts a page capacity, page count or page index to `usize`.
#[must_use]
pub(crate) fn to_usize(value: u32) -> usize {
    usize::try_from(value).expect("u32 always fits in usize on supported targets")
}

/// Size and alignment of the chunks in a pool.
///
/// The size is the stride between neighbouring chunks and is always a multiple of the alignment
/// and at least [`LINK_SIZE`], so a free chunk can host a free list link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ChunkLayout {
    size: usize,
    align: usize,
}

impl ChunkLayout {
    /// Chunk layout for entries of type `T`.
    ///
    /// Fails to compile if `T` is smaller than a pointer.
    #[must_use]
    pub(crate) const fn of<T>() -> Self {
        const {
            assert!(
                size_of::<T>() >= LINK_SIZE,
                "entry type size must be equal to or greater than pointer size"
            );
        }

        // Rust guarantees that the size of a type is a multiple of its alignment.
        Self {
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }

    /// Chunk layout for entries with the given memory layout.
    ///
    /// # Panics
    ///
    /// Panics if the layout (padded to its alignment) is smaller than a pointer.
    #[must_use]
    pub(crate) fn from_layout(layout: Layout) -> Self {
        let layout = layout.pad_to_align();

        assert!(
            layout.size() >= LINK_SIZE,
            "chunk size {} must be equal to or greater than pointer size {LINK_SIZE}",
            layout.size()
        );

        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }

    #[must_use]
    pub(crate) fn size(self) -> usize {
        self.size
    }

    #[must_use]
    pub(crate) fn align(self) -> usize {
        self.align
    }

    /// Offset of the first chunk from the start of its page.
    #[must_use]
    pub(crate) fn first_chunk_offset(self) -> usize {
        LINK_SIZE.next_multiple_of(self.align())
    }

    /// Memory layout of a page holding `page_capacity` chunks of this layout.
    ///
    /// # Panics
    ///
    /// Panics if the page would not fit in the address space.
    #[must_use]
    pub(crate) fn page_layout(self, page_capacity: NonZero<u32>) -> Layout {
        let size = self
            .size
            .checked_mul(to_usize(page_capacity.get()))
            .and_then(|chunks| chunks.checked_add(self.first_chunk_offset()))
            .expect("page size must fit in the address space");

        Layout::from_size_align(size, self.align().max(align_of::<*mut u8>()))
            .expect("page layout must fit in the address space")
    }
}

/// Returns the first chunk of a page.
///
/// # Safety
///
/// The caller must ensure that `page` is a live page constructed with the same chunk layout.
#[must_use]
pub(crate) unsafe fn first_chunk(page: NonNull<u8>, chunk: ChunkLayout) -> NonNull<u8> {
    // SAFETY: The header is part of the page allocation and the caller guarantees the page
    // is live, so the first chunk is in bounds.
    unsafe { page.add(chunk.first_chunk_offset()) }
}

/// Returns the last chunk of a page, given its first chunk.
///
/// # Safety
///
/// The caller must ensure that `first` is the first chunk of a live page with `page_capacity`
/// chunks of the given layout.
#[must_use]
pub(crate) unsafe fn last_chunk(
    page_capacity: NonZero<u32>,
    chunk: ChunkLayout,
    first: NonNull<u8>,
) -> NonNull<u8> {
    // Cannot overflow because the page layout calculation already checked the full page size.
    let offset = to_usize(page_capacity.get().wrapping_sub(1)).wrapping_mul(chunk.size());

    // SAFETY: The caller guarantees that the page holds `page_capacity` chunks after `first`.
    unsafe { first.add(offset) }
}

/// Returns the chunk that follows `current` in the same page.
///
/// # Safety
///
/// The caller must ensure that `current` is a chunk of a live page and is not the last chunk
/// of that page.
#[must_use]
pub(crate) unsafe fn next_chunk(current: NonNull<u8>, chunk: ChunkLayout) -> NonNull<u8> {
    // SAFETY: The caller guarantees there is another chunk after `current` in the same page.
    unsafe { current.add(chunk.size()) }
}

/// Whether `candidate` points into the chunk area of `page`.
///
/// This only compares addresses and never touches the memory behind the pointers.
#[must_use]
pub(crate) fn is_from(
    page: NonNull<u8>,
    page_capacity: NonZero<u32>,
    chunk: ChunkLayout,
    candidate: NonNull<u8>,
) -> bool {
    let first = page.addr().get().wrapping_add(chunk.first_chunk_offset());
    let last = first.wrapping_add(
        to_usize(page_capacity.get().wrapping_sub(1)).wrapping_mul(chunk.size()),
    );

    (first..=last).contains(&candidate.addr().get())
}

/// Returns the index of `candidate` within the chunks of `page`.
///
/// # Panics
///
/// Panics if `candidate` is not within the chunk area of `page`.
#[must_use]
pub(crate) fn chunk_index_in_page(
    page: NonNull<u8>,
    page_capacity: NonZero<u32>,
    chunk: ChunkLayout,
    candidate: NonNull<u8>,
) -> usize {
    assert!(
        is_from(page, page_capacity, chunk, candidate),
        "chunk {candidate:?} does not belong to page {page:?}"
    );

    let first = page.addr().get().wrapping_add(chunk.first_chunk_offset());

    // Cannot underflow, we asserted above that the candidate is at or after the first chunk.
    candidate
        .addr()
        .get()
        .wrapping_sub(first)
        .checked_div(chunk.size())
        .expect("chunk size is never zero")
}

/// Requests a page from the host memory and threads all of its chunks into a free list.
///
/// Every chunk links to the next one. The link of the last chunk is left uninitialized; the
/// caller decides what follows it.
pub(crate) fn construct_empty_page(
    host: &impl HostMemory,
    page_layout: Layout,
    page_capacity: NonZero<u32>,
    chunk: ChunkLayout,
) -> Result<NonNull<u8>> {
    let Some(page) = host.allocate(page_layout) else {
        debug!(
            size = page_layout.size(),
            align = page_layout.align(),
            "host memory could not provide a page"
        );

        return Err(Error::PageAllocation {
            size: page_layout.size(),
            align: page_layout.align(),
        });
    };

    // SAFETY: The page was just allocated with a layout derived from this chunk layout.
    let first = unsafe { first_chunk(page, chunk) };
    // SAFETY: As above, the page holds `page_capacity` chunks starting at `first`.
    let last = unsafe { last_chunk(page_capacity, chunk, first) };

    let mut current = first;

    while current != last {
        // SAFETY: `current` is before `last`, so another chunk follows it in this page.
        let next = unsafe { next_chunk(current, chunk) };

        // SAFETY: `current` is a chunk of the new page, which nobody else references yet.
        unsafe {
            free_list::set_next_free_chunk(current, Some(next));
        }

        current = next;
    }

    trace!(
        page = ?page,
        size = page_layout.size(),
        chunks = page_capacity.get(),
        "allocated page"
    );

    Ok(page)
}

/// Returns a page to the host memory.
///
/// # Safety
///
/// The caller must ensure that `page` was returned by [`construct_empty_page()`] with the same
/// `page_layout` and host, is no longer linked into any page list and that no chunk of the page
/// is used after this call.
pub(crate) unsafe fn release_page(host: &impl HostMemory, page: NonNull<u8>, page_layout: Layout) {
    trace!(page = ?page, size = page_layout.size(), "releasing page");

    // SAFETY: Forwarding safety requirements to the caller.
    unsafe {
        host.deallocate(page, page_layout);
    }
}

/// Returns the page that follows `page` in its page list.
///
/// # Safety
///
/// The caller must ensure that `page` is a live page whose header has been initialized by
/// [`set_next_page()`].
#[must_use]
pub(crate) unsafe fn next_page(page: NonNull<u8>) -> Option<NonNull<u8>> {
    // SAFETY: Pages are aligned for pointers and the header word is initialized, as guaranteed
    // by the caller.
    NonNull::new(unsafe { page.cast::<*mut u8>().read() })
}

/// Sets the page that follows `page` in its page list.
///
/// # Safety
///
/// The caller must ensure that `page` is a live page that it has exclusive access to.
pub(crate) unsafe fn set_next_page(page: NonNull<u8>, next: Option<NonNull<u8>>) {
    // SAFETY: Pages are aligned for pointers and the caller guarantees exclusive access.
    unsafe {
        page.cast::<*mut u8>()
            .write(next.map_or(ptr::null_mut(), NonNull::as_ptr));
    }
}

/// Iterates over the pages of a pool from the most recently added page to the oldest.
///
/// The iterator reads the link of a page before yielding it.
#[derive(Debug)]
pub(crate) struct PageIter<'a> {
    current: Option<NonNull<u8>>,
    _fields: PhantomData<&'a BasePoolFields>,
}

impl<'a> PageIter<'a> {
    #[must_use]
    pub(crate) fn new(fields: &'a BasePoolFields) -> Self {
        Self {
            current: fields.top_page,
            _fields: PhantomData,
        }
    }
}

impl Iterator for PageIter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.current?;

        // SAFETY: Every page reachable from the page list of a pool is live and has an
        // initialized header. The borrow of the fields keeps the list from changing.
        self.current = unsafe { next_page(page) };

        Some(page)
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::pal::{FakeHostMemory, HostMemoryFacade};

    #[repr(C, align(16))]
    #[expect(dead_code, reason = "only the layout of this type is used")]
    struct Wide {
        data: [u64; 2],
    }

    fn at(addr: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut(addr)).unwrap()
    }

    #[test]
    fn chunk_layout_of_matches_type() {
        let layout = ChunkLayout::of::<[u64; 3]>();
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.align(), 8);
        assert_eq!(layout.first_chunk_offset(), LINK_SIZE);
    }

    #[test]
    fn first_chunk_offset_respects_alignment() {
        let layout = ChunkLayout::of::<Wide>();
        assert_eq!(layout.first_chunk_offset(), 16);

        let page_layout = layout.page_layout(nz!(4));
        assert_eq!(page_layout.size(), 16 + 4 * 16);
        assert_eq!(page_layout.align(), 16);
    }

    #[test]
    fn from_layout_pads_to_alignment() {
        let layout = ChunkLayout::from_layout(Layout::from_size_align(12, 8).unwrap());
        assert_eq!(layout.size(), 16);
        assert_eq!(layout.align(), 8);
    }

    #[test]
    fn from_layout_accepts_odd_sizes() {
        let layout = ChunkLayout::from_layout(Layout::from_size_align(13, 1).unwrap());
        assert_eq!(layout.size(), 13);
        assert_eq!(layout.first_chunk_offset(), LINK_SIZE);
        assert_eq!(layout.page_layout(nz!(3)).size(), LINK_SIZE + 39);
    }

    #[test]
    #[should_panic]
    fn from_layout_rejects_chunks_smaller_than_pointer() {
        _ = ChunkLayout::from_layout(Layout::new::<u16>());
    }

    #[test]
    #[should_panic]
    fn page_layout_overflow_panics() {
        let layout = ChunkLayout::from_layout(Layout::from_size_align(usize::MAX / 2, 1).unwrap());
        _ = layout.page_layout(nz!(4));
    }

    #[test]
    fn is_from_covers_exactly_the_chunk_area() {
        let chunk = ChunkLayout::of::<[u64; 2]>();
        let capacity = nz!(4);
        let page = at(0x1000);

        assert!(!is_from(page, capacity, chunk, at(0x1000)));
        assert!(is_from(page, capacity, chunk, at(0x1000 + LINK_SIZE)));
        assert!(is_from(page, capacity, chunk, at(0x1000 + LINK_SIZE + 3 * 16)));
        assert!(!is_from(page, capacity, chunk, at(0x1000 + LINK_SIZE + 4 * 16)));
    }

    #[test]
    fn chunk_index_in_page_counts_strides() {
        let chunk = ChunkLayout::of::<[u64; 3]>();
        let capacity = nz!(8);
        let page = at(0x2000);
        let candidate = at(0x2000 + LINK_SIZE + 5 * 24);

        assert_eq!(chunk_index_in_page(page, capacity, chunk, candidate), 5);
    }

    #[test]
    fn constructed_page_threads_all_chunks() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let chunk = ChunkLayout::of::<[u64; 3]>();
        let capacity = nz!(5);
        let page_layout = chunk.page_layout(capacity);

        let page = construct_empty_page(&host, page_layout, capacity, chunk).unwrap();
        assert_eq!(fake.live_allocations(), 1);

        unsafe {
            let first = first_chunk(page, chunk);
            let last = last_chunk(capacity, chunk, first);

            let mut current = first;
            let mut visited = 1;

            while current != last {
                let next = free_list::next_free_chunk(current).unwrap();
                assert_eq!(next, next_chunk(current, chunk));
                current = next;
                visited += 1;
            }

            assert_eq!(visited, 5);

            release_page(&host, page, page_layout);
        }

        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn construct_page_reports_host_failure() {
        let fake = FakeHostMemory::new();
        fake.set_allocation_budget(Some(0));
        let host = HostMemoryFacade::fake(fake);
        let chunk = ChunkLayout::of::<u64>();
        let page_layout = chunk.page_layout(nz!(2));

        let result = construct_empty_page(&host, page_layout, nz!(2), chunk);

        assert!(matches!(
            result,
            Err(Error::PageAllocation { size, .. }) if size == LINK_SIZE + 2 * size_of::<u64>()
        ));
    }

    #[test]
    fn next_page_round_trips_links() {
        let host = HostMemoryFacade::real();
        let chunk = ChunkLayout::of::<u64>();
        let page_layout = chunk.page_layout(nz!(1));

        let a = construct_empty_page(&host, page_layout, nz!(1), chunk).unwrap();
        let b = construct_empty_page(&host, page_layout, nz!(1), chunk).unwrap();

        unsafe {
            set_next_page(a, Some(b));
            set_next_page(b, None);

            assert_eq!(next_page(a), Some(b));
            assert_eq!(next_page(b), None);

            release_page(&host, a, page_layout);
            release_page(&host, b, page_layout);
        }
    }
}
