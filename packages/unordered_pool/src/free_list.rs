//! Intrusive free list threaded through the bytes of the free chunks themselves.
//!
//! Chunks of untyped pools may have any size that is at least a pointer, so the link words
//! are not necessarily aligned. All link accesses are unaligned.

use std::ptr::{self, NonNull};

use crate::BasePoolFields;

/// Returns the free chunk that follows `chunk` in its free list.
///
/// # Safety
///
/// The caller must ensure that `chunk` is a free chunk of a live page whose link word has been
/// initialized by [`set_next_free_chunk()`].
#[must_use]
pub(crate) unsafe fn next_free_chunk(chunk: NonNull<u8>) -> Option<NonNull<u8>> {
    // SAFETY: Every chunk is at least LINK_SIZE bytes and the caller guarantees the link word
    // is initialized.
    NonNull::new(unsafe { chunk.cast::<*mut u8>().read_unaligned() })
}

/// Sets the free chunk that follows `chunk` in its free list.
///
/// # Safety
///
/// The caller must ensure that `chunk` is a chunk of a live page that holds no live entry and
/// that the caller has exclusive access to.
pub(crate) unsafe fn set_next_free_chunk(chunk: NonNull<u8>, next: Option<NonNull<u8>>) {
    // SAFETY: Every chunk is at least LINK_SIZE bytes and the caller guarantees exclusive access.
    unsafe {
        chunk
            .cast::<*mut u8>()
            .write_unaligned(next.map_or(ptr::null_mut(), NonNull::as_ptr));
    }
}

/// Pushes a chunk on top of the free list of a pool.
///
/// # Safety
///
/// The caller must ensure that `chunk` belongs to a page of the pool that owns `fields`, holds
/// no live entry and is not already in the free list.
pub(crate) unsafe fn push_free_chunk(fields: &mut BasePoolFields, chunk: NonNull<u8>) {
    // SAFETY: Forwarding safety requirements to the caller.
    unsafe {
        set_next_free_chunk(chunk, fields.top_free_chunk);
    }

    fields.top_free_chunk = Some(chunk);
}

/// Pops the top chunk of the free list of a pool.
///
/// # Panics
///
/// Panics if the free list is empty.
#[must_use]
pub(crate) fn pop_free_chunk(fields: &mut BasePoolFields) -> NonNull<u8> {
    let chunk = fields
        .top_free_chunk
        .expect("cannot pop a chunk from an empty free list");

    // SAFETY: Every chunk in the free list of a pool is a free chunk of one of its live pages
    // with an initialized link word.
    fields.top_free_chunk = unsafe { next_free_chunk(chunk) };

    chunk
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
    use crate::ChunkLayout;

    #[test]
    fn push_then_pop_is_last_in_first_out() {
        // Plain buffers stand in for chunks; the free list only needs their link words.
        let mut a = [0_u8; 16];
        let mut b = [0_u8; 16];
        let a_ptr = NonNull::from(&mut a).cast::<u8>();
        let b_ptr = NonNull::from(&mut b).cast::<u8>();

        let mut fields = BasePoolFields::for_empty_pool(nz!(4), ChunkLayout::of::<[u8; 16]>());

        unsafe {
            push_free_chunk(&mut fields, a_ptr);
            push_free_chunk(&mut fields, b_ptr);
        }

        assert_eq!(pop_free_chunk(&mut fields), b_ptr);
        assert_eq!(pop_free_chunk(&mut fields), a_ptr);
        assert!(fields.top_free_chunk.is_none());
    }

    #[test]
    fn links_survive_unaligned_chunks() {
        let mut buffer = [0_u8; 32];
        let base = NonNull::from(&mut buffer).cast::<u8>();

        unsafe {
            let first = base.add(1);
            let second = base.add(14);

            set_next_free_chunk(first, Some(second));
            set_next_free_chunk(second, None);

            assert_eq!(next_free_chunk(first), Some(second));
            assert_eq!(next_free_chunk(second), None);
        }
    }

    #[test]
    #[should_panic]
    fn pop_from_empty_free_list_panics() {
        let mut fields = BasePoolFields::for_empty_pool(nz!(4), ChunkLayout::of::<u64>());
        _ = pop_free_chunk(&mut fields);
    }
}
