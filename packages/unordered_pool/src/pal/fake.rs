//! Fake host memory implementation for testing.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::pal::{HostMemory, RealHostMemory};

/// Internal state for the fake host memory that can be shared between clones.
#[derive(Debug)]
struct FakeHostMemoryState {
    /// How many more allocations may succeed. `None` means unlimited.
    remaining_allocations: Option<usize>,

    /// Number of blocks allocated and not yet released.
    live_allocations: usize,

    /// Number of successful allocations over the lifetime of the fake.
    total_allocations: usize,
}

/// Fake implementation of the host memory abstraction for testing.
///
/// Real memory is still handed out (via [`RealHostMemory`]) so the pools can operate on it
/// normally, but tests can limit how many allocations succeed and inspect how many blocks
/// are currently live. Multiple clones share the same underlying state, so a test can keep
/// a clone to observe and control a fake that has been moved into a pool.
#[derive(Clone, Debug)]
pub(crate) struct FakeHostMemory {
    state: Arc<Mutex<FakeHostMemoryState>>,
}

impl FakeHostMemory {
    /// Creates a new fake host memory that allows unlimited allocations.
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeHostMemoryState {
                remaining_allocations: None,
                live_allocations: 0,
                total_allocations: 0,
            })),
        }
    }

    /// Limits how many more allocations may succeed. `None` removes the limit.
    ///
    /// This affects all clones of this fake.
    pub(crate) fn set_allocation_budget(&self, budget: Option<usize>) {
        self.state
            .lock()
            .expect("FakeHostMemory state lock should not be poisoned")
            .remaining_allocations = budget;
    }

    /// Number of blocks allocated and not yet released.
    pub(crate) fn live_allocations(&self) -> usize {
        self.state
            .lock()
            .expect("FakeHostMemory state lock should not be poisoned")
            .live_allocations
    }

    /// Number of successful allocations since the fake was created.
    pub(crate) fn total_allocations(&self) -> usize {
        self.state
            .lock()
            .expect("FakeHostMemory state lock should not be poisoned")
            .total_allocations
    }
}

impl HostMemory for FakeHostMemory {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut state = self
            .state
            .lock()
            .expect("FakeHostMemory state lock should not be poisoned");

        if let Some(remaining) = state.remaining_allocations.as_mut() {
            if *remaining == 0 {
                return None;
            }

            *remaining = remaining.saturating_sub(1);
        }

        let ptr = RealHostMemory.allocate(layout)?;

        state.live_allocations = state.live_allocations.saturating_add(1);
        state.total_allocations = state.total_allocations.saturating_add(1);

        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut state = self
            .state
            .lock()
            .expect("FakeHostMemory state lock should not be poisoned");

        assert!(
            state.live_allocations > 0,
            "released more blocks than were allocated from FakeHostMemory"
        );

        state.live_allocations = state.live_allocations.saturating_sub(1);

        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            RealHostMemory.deallocate(ptr, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_allocations() {
        let fake = FakeHostMemory::new();
        let layout = Layout::new::<u64>();

        let a = fake.allocate(layout).expect("unlimited budget");
        let b = fake.allocate(layout).expect("unlimited budget");
        assert_eq!(fake.live_allocations(), 2);

        // SAFETY: Allocated above with the same layout, released once.
        unsafe {
            fake.deallocate(a, layout);
        }
        assert_eq!(fake.live_allocations(), 1);

        // SAFETY: Allocated above with the same layout, released once.
        unsafe {
            fake.deallocate(b, layout);
        }
        assert_eq!(fake.live_allocations(), 0);
        assert_eq!(fake.total_allocations(), 2);
    }

    #[test]
    fn budget_limits_allocations() {
        let fake = FakeHostMemory::new();
        let layout = Layout::new::<u64>();

        fake.set_allocation_budget(Some(1));

        let a = fake.allocate(layout).expect("budget allows one allocation");
        assert!(fake.allocate(layout).is_none());

        // The budget is shared between clones.
        let clone = fake.clone();
        clone.set_allocation_budget(None);
        let b = fake.allocate(layout).expect("budget was lifted through the clone");

        // SAFETY: Allocated above with the same layout, released once.
        unsafe {
            fake.deallocate(a, layout);
            fake.deallocate(b, layout);
        }
    }
}
