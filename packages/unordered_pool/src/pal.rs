//! Platform abstraction layer for obtaining page memory from the host allocator.
//!
//! The pools never call the global allocator directly. They go through
//! [`HostMemoryFacade`], which forwards to the real allocator in production and can be
//! switched to a fake in tests to simulate allocation failure and count live pages.

mod abstractions;
mod facade;
#[cfg(test)]
mod fake;
mod real;

pub(crate) use abstractions::HostMemory;
pub(crate) use facade::HostMemoryFacade;
#[cfg(test)]
pub(crate) use fake::FakeHostMemory;
pub(crate) use real::RealHostMemory;
