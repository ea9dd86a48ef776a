//! Facade that dispatches to either the real host memory or a fake in tests.

use std::alloc::Layout;
use std::ptr::NonNull;

#[cfg(test)]
use crate::pal::FakeHostMemory;
use crate::pal::{HostMemory, RealHostMemory};

/// Facade over host memory operations, dispatching to the real or fake implementation.
///
/// In production, this always uses [`RealHostMemory`]. In tests, it can also wrap a
/// [`FakeHostMemory`] for controlled test scenarios.
#[derive(Clone)]
pub(crate) enum HostMemoryFacade {
    /// Real host memory implementation.
    Real(&'static RealHostMemory),

    /// Fake host memory for testing.
    #[cfg(test)]
    Fake(FakeHostMemory),
}

/// Static instance of the real host memory for production use.
static REAL_HOST_MEMORY: RealHostMemory = RealHostMemory;

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl HostMemoryFacade {
    /// Creates a facade using the real host memory.
    pub(crate) const fn real() -> Self {
        Self::Real(&REAL_HOST_MEMORY)
    }

    /// Creates a facade wrapping a fake host memory (test builds only).
    #[cfg(test)]
    pub(crate) fn fake(fake: FakeHostMemory) -> Self {
        Self::Fake(fake)
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl HostMemory for HostMemoryFacade {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        match self {
            Self::Real(host) => host.allocate(layout),
            #[cfg(test)]
            Self::Fake(host) => host.allocate(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self {
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Real(host) => unsafe { host.deallocate(ptr, layout) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Fake(host) => unsafe { host.deallocate(ptr, layout) },
        }
    }
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl std::fmt::Debug for HostMemoryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real(_) => f.debug_struct("HostMemoryFacade::Real").finish(),
            #[cfg(test)]
            Self::Fake(fake) => f
                .debug_struct("HostMemoryFacade::Fake")
                .field("fake", fake)
                .finish(),
        }
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Default for HostMemoryFacade {
    fn default() -> Self {
        Self::real()
    }
}
