//! State owned by a pool and the scratch buffers its engine operations reuse between calls.

use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use crate::ChunkLayout;
use crate::page::{self, PageIter};

/// State shared by all pool variants, operated on by the functions in [`crate::engine`].
///
/// The pool that owns the fields owns every page reachable from `top_page`. The fields are only
/// modified through the engine, free list and page list functions, which maintain:
///
/// * `top_free_chunk.is_some()` implies `top_page.is_some()`.
/// * `page_count` equals the number of pages reachable from `top_page`.
/// * Every chunk reachable from `top_free_chunk` is a chunk of a reachable page.
#[derive(Debug)]
pub(crate) struct BasePoolFields {
    /// Head of the intrusive list of free chunks.
    pub(crate) top_free_chunk: Option<NonNull<u8>>,

    /// Most recently allocated page, head of the intrusive page list.
    pub(crate) top_page: Option<NonNull<u8>>,

    pub(crate) page_count: u32,

    pub(crate) page_capacity: NonZero<u32>,

    /// Layout of every page of the pool, derived from the chunk layout and page capacity.
    pub(crate) page_layout: Layout,

    /// Buffers reused by `shrink()` and `clean()` so they do not allocate on every call.
    pub(crate) scratch: Scratch,
}

impl BasePoolFields {
    /// Fields of a pool without any pages.
    ///
    /// # Panics
    ///
    /// Panics if a page with this capacity and chunk layout would not fit in the address space.
    #[must_use]
    pub(crate) fn for_empty_pool(page_capacity: NonZero<u32>, chunk: ChunkLayout) -> Self {
        Self {
            top_free_chunk: None,
            top_page: None,
            page_count: 0,
            page_capacity,
            page_layout: chunk.page_layout(page_capacity),
            scratch: Scratch::default(),
        }
    }

    /// Iterates over the pages of the pool, most recently allocated first.
    pub(crate) fn pages(&self) -> PageIter<'_> {
        PageIter::new(self)
    }
}

/// Fields of pools whose chunk layout is only known at runtime.
#[derive(Debug)]
pub(crate) struct UntypedPoolFields {
    pub(crate) base: BasePoolFields,
    pub(crate) chunk: ChunkLayout,
}

impl UntypedPoolFields {
    /// Fields of an untyped pool without any pages.
    #[must_use]
    pub(crate) fn for_empty_pool(page_capacity: NonZero<u32>, chunk: ChunkLayout) -> Self {
        Self {
            base: BasePoolFields::for_empty_pool(page_capacity, chunk),
            chunk,
        }
    }
}

/// Working memory for the reclamation algorithms, owned by each pool.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    /// Number of free chunks per page, indexed by position in the page list.
    pub(crate) free_counts: Vec<u32>,

    /// One bit per chunk of the pool, set while the chunk holds a live entry.
    pub(crate) used_chunks: FixedBitSet,

    pub(crate) page_index: PageIndex,
}

/// Pages of a pool sorted by address, for locating the page that owns a chunk.
#[derive(Debug, Default)]
pub(crate) struct PageIndex {
    /// Pages paired with their position in the page list, sorted by page address.
    entries: Vec<(NonNull<u8>, u32)>,
}

impl PageIndex {
    /// Replaces the contents of the index with the current pages of the pool.
    pub(crate) fn rebuild(&mut self, fields: &BasePoolFields) {
        self.entries.clear();

        let mut position: u32 = 0;

        for page in fields.pages() {
            self.entries.push((page, position));

            // Cannot overflow, page_count is a u32 and this counts the same pages.
            position = position.wrapping_add(1);
        }

        self.entries.sort_unstable_by_key(|(page, _)| page.addr());
    }

    /// Finds the page that contains `candidate` and its position in the page list.
    #[must_use]
    pub(crate) fn locate(
        &self,
        page_capacity: NonZero<u32>,
        chunk: ChunkLayout,
        candidate: NonNull<u8>,
    ) -> Option<(NonNull<u8>, u32)> {
        let after = self
            .entries
            .partition_point(|(page, _)| page.addr() <= candidate.addr());

        let &(page, position) = self.entries.get(after.checked_sub(1)?)?;

        page::is_from(page, page_capacity, chunk, candidate).then_some((page, position))
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use new_zealand::nz;

    use super::*;
    use crate::page::LINK_SIZE;

    fn at(addr: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut(addr)).unwrap()
    }

    #[test]
    fn empty_pool_has_no_pages() {
        let fields = BasePoolFields::for_empty_pool(nz!(16), ChunkLayout::of::<u64>());

        assert!(fields.top_page.is_none());
        assert!(fields.top_free_chunk.is_none());
        assert_eq!(fields.page_count, 0);
        assert_eq!(fields.page_capacity, nz!(16));
        assert_eq!(fields.pages().count(), 0);
        assert_eq!(fields.page_layout.size(), LINK_SIZE + 16 * 8);
    }

    #[test]
    fn untyped_fields_remember_chunk_layout() {
        let chunk = ChunkLayout::from_layout(Layout::from_size_align(40, 8).unwrap());
        let fields = UntypedPoolFields::for_empty_pool(nz!(3), chunk);

        assert_eq!(fields.chunk, chunk);
        assert_eq!(fields.base.page_layout, chunk.page_layout(nz!(3)));
    }

    #[test]
    fn page_index_locates_owning_page() {
        let chunk = ChunkLayout::of::<[u64; 2]>();
        let capacity = nz!(4);

        let mut index = PageIndex::default();
        // Deliberately out of address order, as page lists usually are.
        index.entries = vec![(at(0x3000), 0), (at(0x1000), 1), (at(0x2000), 2)];
        index
            .entries
            .sort_unstable_by_key(|(page, _)| page.addr());

        let located = index.locate(capacity, chunk, at(0x2000 + LINK_SIZE + 16));
        assert_eq!(located, Some((at(0x2000), 2)));

        let located = index.locate(capacity, chunk, at(0x3000 + LINK_SIZE));
        assert_eq!(located, Some((at(0x3000), 0)));

        // Before the first page and in the header of a page.
        assert_eq!(index.locate(capacity, chunk, at(0x0800)), None);
        assert_eq!(index.locate(capacity, chunk, at(0x1000)), None);

        // Past the last chunk of a page.
        assert_eq!(
            index.locate(capacity, chunk, at(0x1000 + LINK_SIZE + 4 * 16)),
            None
        );
    }
}
