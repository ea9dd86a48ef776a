//! Pool algorithms shared by every pool variant.
//!
//! The functions here operate on the fields owned by a pool and never own state themselves.
//! Typed pools pass `ChunkLayout::of::<T>()` as the chunk layout, untyped pools pass the layout
//! they were configured with.

use std::alloc::Layout;
use std::mem;
use std::ptr::NonNull;

use tracing::debug;

use crate::page::{self, LINK_SIZE, to_usize};
use crate::pal::HostMemory;
use crate::{BasePoolFields, ChunkLayout, INTEGRITY_CHECKS, Result, free_list};

/// Verifies the structural invariants of a pool.
///
/// Does nothing unless integrity checks are compiled in.
///
/// # Panics
///
/// Panics if the pool state is inconsistent.
#[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
pub(crate) fn assert_pool_state(fields: &BasePoolFields, chunk: ChunkLayout) {
    if !INTEGRITY_CHECKS {
        return;
    }

    assert!(
        chunk.size() >= LINK_SIZE,
        "chunk size {} is smaller than a free list link",
        chunk.size()
    );

    assert!(
        fields.top_free_chunk.is_none() || fields.top_page.is_some(),
        "pool has free chunks but no pages"
    );

    let observed_page_count = fields.pages().count();

    assert!(
        observed_page_count == to_usize(fields.page_count),
        "pool page count {} does not match the {} pages in its page list",
        fields.page_count,
        observed_page_count
    );
}

/// Verifies that `entry` is a chunk of this pool that is currently handed out.
///
/// Does nothing unless integrity checks are compiled in.
///
/// # Panics
///
/// Panics if `entry` is not on a chunk boundary inside a page of the pool, or if it is the most
/// recently freed chunk. Older duplicates in the free list are caught by `shrink()` and
/// `non_trivial_clean()`, which walk the free list anyway.
#[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
pub(crate) fn assert_from_pool(fields: &BasePoolFields, chunk: ChunkLayout, entry: NonNull<u8>) {
    if !INTEGRITY_CHECKS {
        return;
    }

    let Some((page, _)) = find_chunk_page(fields, chunk, entry) else {
        panic!("entry {entry:?} does not belong to any page of this pool");
    };

    let offset_in_chunk_area = entry
        .addr()
        .get()
        .wrapping_sub(page.addr().get())
        .wrapping_sub(chunk.first_chunk_offset());

    assert!(
        offset_in_chunk_area.checked_rem(chunk.size()) == Some(0),
        "entry {entry:?} is not on a chunk boundary of page {page:?}"
    );

    assert!(
        fields.top_free_chunk != Some(entry),
        "entry {entry:?} is already in the free list of this pool"
    );
}

/// Finds the page of the pool that contains `candidate`, together with the position of that
/// page in the page list (0 is the most recently allocated page).
///
/// This is a linear scan over the page list and only compares addresses.
#[must_use]
pub(crate) fn find_chunk_page(
    fields: &BasePoolFields,
    chunk: ChunkLayout,
    candidate: NonNull<u8>,
) -> Option<(NonNull<u8>, u32)> {
    fields
        .pages()
        .zip(0_u32..)
        .find(|&(page, _)| page::is_from(page, fields.page_capacity, chunk, candidate))
}

/// Links a page as the new head of the page list.
///
/// # Safety
///
/// The caller must ensure that `page` is a live page constructed for this pool that is not
/// already in the page list.
pub(crate) unsafe fn push_page(fields: &mut BasePoolFields, page: NonNull<u8>) {
    // SAFETY: Forwarding safety requirements to the caller.
    unsafe {
        page::set_next_page(page, fields.top_page);
    }

    fields.top_page = Some(page);
    fields.page_count = fields
        .page_count
        .checked_add(1)
        .expect("page count of a pool cannot exceed u32::MAX");
}

/// Unlinks `page` from the page list and returns it to the host memory.
///
/// `previous` is the page before `page` in the list (`None` if `page` is the head) and `next`
/// is the page after it.
///
/// # Safety
///
/// The caller must ensure that `page` is in the page list of the pool with the given
/// neighbours and that no chunk of the page is referenced by the free list or by any caller.
pub(crate) unsafe fn pop_page(
    fields: &mut BasePoolFields,
    host: &impl HostMemory,
    page: NonNull<u8>,
    previous: Option<NonNull<u8>>,
    next: Option<NonNull<u8>>,
) {
    if INTEGRITY_CHECKS {
        // SAFETY: The caller guarantees that `page` is a live page of this pool.
        let actual_next = unsafe { page::next_page(page) };
        assert!(actual_next == next, "page {page:?} is not followed by {next:?}");

        match previous {
            None => assert!(
                fields.top_page == Some(page),
                "page {page:?} has no previous page but is not the top page"
            ),
            Some(previous) => {
                // SAFETY: The caller guarantees that `previous` is a live page of this pool.
                let after_previous = unsafe { page::next_page(previous) };
                assert!(
                    after_previous == Some(page),
                    "page {previous:?} is not followed by {page:?}"
                );
            }
        }
    }

    match previous {
        None => fields.top_page = next,
        // SAFETY: The caller guarantees that `previous` is a live page of this pool, which we
        // have exclusive access to via the fields.
        Some(previous) => unsafe { page::set_next_page(previous, next) },
    }

    fields.page_count = fields
        .page_count
        .checked_sub(1)
        .expect("cannot pop a page from a pool without pages");

    // SAFETY: The page is no longer linked into the page list and the caller guarantees that
    // none of its chunks are referenced anymore.
    unsafe {
        page::release_page(host, page, fields.page_layout);
    }
}

/// Takes a free chunk from the pool, allocating a new page if no chunk is free.
///
/// The contents of the returned chunk are unspecified.
pub(crate) fn acquire(
    fields: &mut BasePoolFields,
    host: &impl HostMemory,
    chunk: ChunkLayout,
) -> Result<NonNull<u8>> {
    assert_pool_state(fields, chunk);

    if fields.top_free_chunk.is_none() {
        let page =
            page::construct_empty_page(host, fields.page_layout, fields.page_capacity, chunk)?;

        // SAFETY: The page was just constructed with this chunk layout and capacity.
        let first = unsafe { page::first_chunk(page, chunk) };
        // SAFETY: As above.
        let last = unsafe { page::last_chunk(fields.page_capacity, chunk, first) };

        // SAFETY: `last` is a chunk of the new page, which nobody else references yet.
        unsafe {
            free_list::set_next_free_chunk(last, fields.top_free_chunk);
        }

        fields.top_free_chunk = Some(first);

        // SAFETY: The page was just constructed for this pool and is not in the page list yet.
        unsafe {
            push_page(fields, page);
        }
    }

    Ok(free_list::pop_free_chunk(fields))
}

/// Returns a chunk to the free list of the pool.
///
/// # Safety
///
/// The caller must ensure that `entry` was returned by [`acquire()`] for the same fields, has
/// not been freed since and holds no live value that still needs dropping.
pub(crate) unsafe fn free(fields: &mut BasePoolFields, chunk: ChunkLayout, entry: NonNull<u8>) {
    assert_pool_state(fields, chunk);
    assert_from_pool(fields, chunk, entry);

    // SAFETY: Forwarding safety requirements to the caller.
    unsafe {
        free_list::push_free_chunk(fields, entry);
    }
}

/// Releases every page of the pool without touching the chunks.
///
/// Any chunk still handed out becomes dangling.
pub(crate) fn trivial_clean(fields: &mut BasePoolFields, host: &impl HostMemory, chunk: ChunkLayout) {
    assert_pool_state(fields, chunk);

    let released = mem::replace(&mut fields.page_count, 0);
    let top_page = fields.top_page.take();
    fields.top_free_chunk = None;

    // SAFETY: The page list was detached from the pool above, so nothing references it anymore.
    unsafe {
        release_page_list(host, top_page, fields.page_layout);
    }

    if released > 0 {
        debug!(released, "released all pages of pool");
    }
}

/// Calls `destructor` exactly once on every chunk that is handed out, then releases every page
/// of the pool.
///
/// The pool is empty before the first destructor call, so a panicking destructor leaves the
/// pool usable. Pages are released even if a destructor panics; the entries that were not yet
/// destructed at that point are leaked.
pub(crate) fn non_trivial_clean(
    fields: &mut BasePoolFields,
    host: &impl HostMemory,
    chunk: ChunkLayout,
    mut destructor: impl FnMut(NonNull<u8>),
) {
    assert_pool_state(fields, chunk);

    if fields.top_page.is_none() {
        return;
    }

    let page_capacity = to_usize(fields.page_capacity.get());
    let chunk_count = to_usize(fields.page_count)
        .checked_mul(page_capacity)
        .expect("chunk count was validated when the pages were allocated");

    let mut scratch = mem::take(&mut fields.scratch);

    scratch.used_chunks.clear();
    scratch.used_chunks.grow(chunk_count);
    scratch.used_chunks.set_range(..chunk_count, true);

    scratch.page_index.rebuild(fields);

    let mut current = fields.top_free_chunk;

    while let Some(free_chunk) = current {
        let (page, position) = scratch
            .page_index
            .locate(fields.page_capacity, chunk, free_chunk)
            .expect("every free chunk of a pool belongs to one of its pages");

        let slot = page::chunk_index_in_page(page, fields.page_capacity, chunk, free_chunk);

        // Cannot overflow, the position and slot are within the chunk count checked above.
        let bit = to_usize(position)
            .wrapping_mul(page_capacity)
            .wrapping_add(slot);

        assert!(
            scratch.used_chunks.contains(bit),
            "chunk {free_chunk:?} appears more than once in the free list of this pool"
        );

        scratch.used_chunks.set(bit, false);

        // SAFETY: Every chunk in the free list of a pool has an initialized link word.
        current = unsafe { free_list::next_free_chunk(free_chunk) };
    }

    let released = mem::replace(&mut fields.page_count, 0);
    let top_page = fields.top_page.take();
    fields.top_free_chunk = None;
    let page_layout = fields.page_layout;

    let release_pages = scopeguard::guard(top_page, |top_page| {
        // SAFETY: The page list was detached from the pool above. The guard runs after the last
        // destructor call, so nothing references the pages anymore.
        unsafe {
            release_page_list(host, top_page, page_layout);
        }
    });

    let mut current = *release_pages;
    let mut first_bit: usize = 0;

    while let Some(page) = current {
        // SAFETY: The page is still live, it is only released by the guard above.
        current = unsafe { page::next_page(page) };

        // SAFETY: As above, and the page was constructed with this chunk layout.
        let mut entry = unsafe { page::first_chunk(page, chunk) };

        for slot in 0..page_capacity {
            if scratch.used_chunks.contains(first_bit.wrapping_add(slot)) {
                destructor(entry);
            }

            if slot.wrapping_add(1) < page_capacity {
                // SAFETY: `entry` is not the last chunk of its page.
                entry = unsafe { page::next_chunk(entry, chunk) };
            }
        }

        first_bit = first_bit.wrapping_add(page_capacity);
    }

    drop(release_pages);

    fields.scratch = scratch;

    debug!(released, "destructed live entries and released all pages of pool");
}

/// Releases every page of the pool that holds no live entry.
///
/// Pages with at least one live entry are kept together with exactly their free chunks.
pub(crate) fn shrink(fields: &mut BasePoolFields, host: &impl HostMemory, chunk: ChunkLayout) {
    assert_pool_state(fields, chunk);

    if fields.top_free_chunk.is_none() {
        return;
    }

    let page_capacity = fields.page_capacity;
    let mut scratch = mem::take(&mut fields.scratch);

    scratch.page_index.rebuild(fields);
    scratch.free_counts.clear();
    scratch.free_counts.resize(to_usize(fields.page_count), 0);

    let mut current = fields.top_free_chunk;

    while let Some(free_chunk) = current {
        let (page, position) = scratch
            .page_index
            .locate(page_capacity, chunk, free_chunk)
            .expect("every free chunk of a pool belongs to one of its pages");

        let free_count = scratch
            .free_counts
            .get_mut(to_usize(position))
            .expect("page index positions are within the page count");

        assert!(
            *free_count < page_capacity.get(),
            "page {page:?} has more free chunks than its capacity, a chunk was freed twice"
        );

        *free_count = free_count.wrapping_add(1);

        // SAFETY: Every chunk in the free list of a pool has an initialized link word.
        current = unsafe { free_list::next_free_chunk(free_chunk) };
    }

    let is_releasable = |free_counts: &[u32], position: u32| {
        free_counts.get(to_usize(position)) == Some(&page_capacity.get())
    };

    if !(0..fields.page_count).any(|position| is_releasable(&scratch.free_counts, position)) {
        fields.scratch = scratch;
        return;
    }

    // Splice the chunks of releasable pages out of the free list.
    let mut previous: Option<NonNull<u8>> = None;
    let mut current = fields.top_free_chunk;

    while let Some(free_chunk) = current {
        // SAFETY: Every chunk in the free list of a pool has an initialized link word.
        let next = unsafe { free_list::next_free_chunk(free_chunk) };

        let (_, position) = scratch
            .page_index
            .locate(page_capacity, chunk, free_chunk)
            .expect("every free chunk of a pool belongs to one of its pages");

        if is_releasable(&scratch.free_counts, position) {
            match previous {
                None => fields.top_free_chunk = next,
                // SAFETY: `previous` is a free chunk of a page that is being kept.
                Some(previous) => unsafe { free_list::set_next_free_chunk(previous, next) },
            }
        } else {
            previous = Some(free_chunk);
        }

        current = next;
    }

    let mut released: u32 = 0;
    let mut previous: Option<NonNull<u8>> = None;
    let mut current = fields.top_page;
    let mut position: u32 = 0;

    while let Some(page) = current {
        // SAFETY: Every page in the page list of a pool is live with an initialized header.
        let next = unsafe { page::next_page(page) };

        if is_releasable(&scratch.free_counts, position) {
            // SAFETY: The page is in the page list with these neighbours, none of its chunks are
            // handed out and its free chunks were spliced out of the free list above.
            unsafe {
                pop_page(fields, host, page, previous, next);
            }

            released = released.wrapping_add(1);
        } else {
            previous = Some(page);
        }

        current = next;
        position = position.wrapping_add(1);
    }

    fields.scratch = scratch;

    debug!(
        released,
        remaining = fields.page_count,
        "released free pages of pool"
    );

    assert_pool_state(fields, chunk);
}

/// Returns every page of a detached page list to the host memory.
///
/// # Safety
///
/// The caller must ensure that the list starting at `top_page` is no longer reachable from any
/// pool and that no chunk of its pages is used after this call.
unsafe fn release_page_list(
    host: &impl HostMemory,
    top_page: Option<NonNull<u8>>,
    page_layout: Layout,
) {
    let mut current = top_page;

    while let Some(page) = current {
        // SAFETY: The page is still live, we read its link before releasing it.
        current = unsafe { page::next_page(page) };

        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            page::release_page(host, page, page_layout);
        }
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
    use std::collections::HashSet;
    use std::num::NonZero;

    use new_zealand::nz;

    use super::*;
    use crate::Error;
    use crate::pal::{FakeHostMemory, HostMemoryFacade};

    const CAPACITY: NonZero<u32> = nz!(4);

    fn chunk_layout() -> ChunkLayout {
        ChunkLayout::of::<[u64; 2]>()
    }

    fn new_fields() -> BasePoolFields {
        BasePoolFields::for_empty_pool(CAPACITY, chunk_layout())
    }

    fn acquire_many(
        fields: &mut BasePoolFields,
        host: &HostMemoryFacade,
        count: usize,
    ) -> Vec<NonNull<u8>> {
        (0..count)
            .map(|_| acquire(fields, host, chunk_layout()).unwrap())
            .collect()
    }

    fn free_all(fields: &mut BasePoolFields, entries: &[NonNull<u8>]) {
        for entry in entries {
            unsafe { free(fields, chunk_layout(), *entry) };
        }
    }

    fn free_list_len(fields: &BasePoolFields) -> usize {
        let mut len = 0;
        let mut current = fields.top_free_chunk;

        while let Some(chunk) = current {
            len += 1;
            current = unsafe { free_list::next_free_chunk(chunk) };
        }

        len
    }

    #[test]
    fn acquire_allocates_pages_on_demand() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let mut fields = new_fields();

        for count in 0..9_u32 {
            _ = acquire(&mut fields, &host, chunk_layout()).unwrap();
            assert_eq!(fields.page_count, 1 + count / CAPACITY.get());
        }

        assert_eq!(fake.live_allocations(), 3);

        trivial_clean(&mut fields, &host, chunk_layout());
        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn acquired_chunks_are_distinct_and_owned() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 10);

        let unique: HashSet<_> = entries.iter().copied().collect();
        assert_eq!(unique.len(), 10);

        for entry in &entries {
            let (page, _) = find_chunk_page(&fields, chunk_layout(), *entry).unwrap();
            let slot = page::chunk_index_in_page(page, CAPACITY, chunk_layout(), *entry);
            assert!(slot < 4);
        }

        trivial_clean(&mut fields, &host, chunk_layout());
    }

    #[test]
    fn freed_chunk_is_reused_first() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 3);
        unsafe { free(&mut fields, chunk_layout(), entries[1]) };

        let reused = acquire(&mut fields, &host, chunk_layout()).unwrap();
        assert_eq!(reused, entries[1]);
        assert_eq!(fields.page_count, 1);

        trivial_clean(&mut fields, &host, chunk_layout());
    }

    #[test]
    fn find_chunk_page_reports_list_position() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 8);

        // The first page allocated is now second in the list.
        let (_, position) = find_chunk_page(&fields, chunk_layout(), entries[0]).unwrap();
        assert_eq!(position, 1);

        let (page, position) = find_chunk_page(&fields, chunk_layout(), entries[7]).unwrap();
        assert_eq!(position, 0);
        assert_eq!(Some(page), fields.top_page);

        let mut outside = 0_u64;
        let outside = NonNull::from(&mut outside).cast::<u8>();
        assert!(find_chunk_page(&fields, chunk_layout(), outside).is_none());

        trivial_clean(&mut fields, &host, chunk_layout());
    }

    #[test]
    fn shrink_releases_only_fully_free_pages() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 8);
        assert_eq!(fields.page_count, 2);

        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 2);

        // Half of each page.
        free_all(&mut fields, &[entries[0], entries[1], entries[4], entries[5]]);
        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 2);
        assert_eq!(free_list_len(&fields), 4);

        // The rest of the first page.
        free_all(&mut fields, &[entries[2], entries[3]]);
        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 1);
        assert_eq!(fake.live_allocations(), 1);
        assert_eq!(free_list_len(&fields), 2);

        // The rest of the second page.
        free_all(&mut fields, &[entries[6], entries[7]]);
        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 0);
        assert!(fields.top_page.is_none());
        assert!(fields.top_free_chunk.is_none());
        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn shrink_keeps_pool_usable() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 12);

        // Free the middle page of three.
        free_all(&mut fields, &entries[4..8]);
        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 2);
        assert!(fields.top_free_chunk.is_none());

        let replacement = acquire_many(&mut fields, &host, 4);
        assert_eq!(fields.page_count, 3);

        free_all(&mut fields, &entries[..4]);
        free_all(&mut fields, &entries[8..]);
        free_all(&mut fields, &replacement);

        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 0);
    }

    #[test]
    fn non_trivial_clean_destructs_each_live_chunk_once() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 10);
        let freed = [entries[0], entries[5], entries[9]];
        free_all(&mut fields, &freed);

        let mut destructed = Vec::new();
        non_trivial_clean(&mut fields, &host, chunk_layout(), |entry| {
            destructed.push(entry);
        });

        let expected: HashSet<_> = entries
            .iter()
            .copied()
            .filter(|entry| !freed.contains(entry))
            .collect();
        let actual: HashSet<_> = destructed.iter().copied().collect();

        assert_eq!(destructed.len(), 7);
        assert_eq!(actual, expected);
        assert_eq!(fields.page_count, 0);
        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn non_trivial_clean_reuses_scratch_across_calls() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        _ = acquire_many(&mut fields, &host, 9);
        let mut count = 0;
        non_trivial_clean(&mut fields, &host, chunk_layout(), |_| count += 1);
        assert_eq!(count, 9);

        // Fewer pages than before, the larger bit table must not report stale entries.
        let entries = acquire_many(&mut fields, &host, 2);
        unsafe { free(&mut fields, chunk_layout(), entries[0]) };

        let mut count = 0;
        non_trivial_clean(&mut fields, &host, chunk_layout(), |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn non_trivial_clean_releases_pages_when_destructor_panics() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let mut fields = new_fields();

        _ = acquire_many(&mut fields, &host, 6);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            non_trivial_clean(&mut fields, &host, chunk_layout(), |_| {
                panic!("destructor failure");
            });
        }));

        assert!(result.is_err());
        assert_eq!(fields.page_count, 0);
        assert!(fields.top_page.is_none());
        assert_eq!(fake.live_allocations(), 0);

        // The pool is still usable afterwards.
        _ = acquire(&mut fields, &host, chunk_layout()).unwrap();
        trivial_clean(&mut fields, &host, chunk_layout());
    }

    #[test]
    fn allocation_failure_leaves_pool_unchanged() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let mut fields = new_fields();

        let entries = acquire_many(&mut fields, &host, 4);
        fake.set_allocation_budget(Some(0));

        let result = acquire(&mut fields, &host, chunk_layout());
        assert!(matches!(result, Err(Error::PageAllocation { .. })));
        assert_eq!(fields.page_count, 1);

        // Freed chunks can still be acquired without a new page.
        unsafe { free(&mut fields, chunk_layout(), entries[2]) };
        assert_eq!(acquire(&mut fields, &host, chunk_layout()).unwrap(), entries[2]);

        fake.set_allocation_budget(None);
        _ = acquire(&mut fields, &host, chunk_layout()).unwrap();
        assert_eq!(fields.page_count, 2);

        trivial_clean(&mut fields, &host, chunk_layout());
        assert_eq!(fake.live_allocations(), 0);
    }

    #[test]
    fn pop_page_unlinks_middle_page() {
        let fake = FakeHostMemory::new();
        let host = HostMemoryFacade::fake(fake.clone());
        let mut fields = BasePoolFields::for_empty_pool(nz!(1), chunk_layout());

        // One chunk per page, so each acquire adds a page.
        _ = acquire_many(&mut fields, &host, 3);

        let pages: Vec<_> = fields.pages().collect();
        assert_eq!(pages.len(), 3);

        unsafe { pop_page(&mut fields, &host, pages[1], Some(pages[0]), Some(pages[2])) };

        assert_eq!(fields.page_count, 2);
        assert_eq!(fields.pages().collect::<Vec<_>>(), vec![pages[0], pages[2]]);
        assert_eq!(fake.live_allocations(), 2);

        trivial_clean(&mut fields, &host, chunk_layout());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn double_free_is_detected() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        let entry = acquire(&mut fields, &host, chunk_layout()).unwrap();

        unsafe {
            free(&mut fields, chunk_layout(), entry);
            free(&mut fields, chunk_layout(), entry);
        }
    }

    /// Frees `a` again after `b`, which links `a -> b -> a` into a cycle that `free()` does not
    /// see because `a` is not the most recently freed chunk.
    fn free_list_with_duplicate(fields: &mut BasePoolFields, host: &HostMemoryFacade) {
        let entries = acquire_many(fields, host, 2);

        unsafe {
            free(fields, chunk_layout(), entries[0]);
            free(fields, chunk_layout(), entries[1]);
            free(fields, chunk_layout(), entries[0]);
        }
    }

    #[test]
    #[should_panic]
    fn shrink_detects_duplicate_free_chunk() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        free_list_with_duplicate(&mut fields, &host);

        shrink(&mut fields, &host, chunk_layout());
    }

    #[test]
    #[should_panic]
    fn non_trivial_clean_detects_duplicate_free_chunk() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        free_list_with_duplicate(&mut fields, &host);

        non_trivial_clean(&mut fields, &host, chunk_layout(), |_| {});
    }

    #[test]
    fn bulk_free_completes_with_many_free_chunks() {
        let host = HostMemoryFacade::real();
        let mut fields = BasePoolFields::for_empty_pool(nz!(128), chunk_layout());

        let entries: Vec<_> = (0..20_000)
            .map(|_| acquire(&mut fields, &host, chunk_layout()).unwrap())
            .collect();

        free_all(&mut fields, &entries);
        assert_eq!(free_list_len(&fields), 20_000_usize.next_multiple_of(128));

        shrink(&mut fields, &host, chunk_layout());
        assert_eq!(fields.page_count, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn foreign_entry_is_detected() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        _ = acquire(&mut fields, &host, chunk_layout()).unwrap();

        let mut foreign = [0_u64; 2];
        let foreign = NonNull::from(&mut foreign).cast::<u8>();

        unsafe { free(&mut fields, chunk_layout(), foreign) };
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn misaligned_entry_is_detected() {
        let host = HostMemoryFacade::real();
        let mut fields = new_fields();

        let entry = acquire(&mut fields, &host, chunk_layout()).unwrap();

        unsafe { free(&mut fields, chunk_layout(), entry.add(1)) };
    }
}
