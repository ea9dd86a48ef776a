//! Real host memory implementation that delegates to the global allocator.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use crate::pal::HostMemory;

/// Host memory backed by the Rust global allocator.
#[derive(Debug, Default)]
pub(crate) struct RealHostMemory;

// Trivial forwarder to system APIs - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl HostMemory for RealHostMemory {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "pages are never zero-sized");

        // SAFETY: Pages always contain at least a header word, so the layout is non-zero-sized.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}
