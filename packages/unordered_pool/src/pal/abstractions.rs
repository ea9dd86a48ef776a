//! Host memory abstraction trait definitions.

use std::alloc::Layout;
use std::fmt::Debug;
use std::ptr::NonNull;

/// Provides raw memory blocks to the pools.
///
/// This is the only capability the pools need from the host: allocate a block of a given
/// layout (which may fail) and release a block that was previously allocated.
pub(crate) trait HostMemory: Debug + Send + Sync + 'static {
    /// Allocates a block of memory with the given non-zero-sized layout.
    ///
    /// Returns `None` if the host cannot satisfy the request. The contents of the
    /// returned block are uninitialized.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block of memory previously returned by [`allocate()`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by `allocate()` on the same host with
    /// the same `layout` and has not been released yet.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}
