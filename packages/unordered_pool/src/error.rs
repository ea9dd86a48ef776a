use thiserror::Error;

/// Errors that can occur when a pool needs more memory from the host allocator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The host allocator could not provide memory for a new page.
    ///
    /// The pool is left unchanged and remains usable. Chunks that are freed later can still be
    /// acquired without a new page being requested.
    #[error("host allocator could not provide a {size}-byte page with alignment {align}")]
    PageAllocation {
        /// The size in bytes of the page that was requested.
        size: usize,

        /// The alignment in bytes of the page that was requested.
        align: usize,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn page_allocation_message_names_layout() {
        let error = Error::PageAllocation {
            size: 4104,
            align: 8,
        };

        let message = error.to_string();
        assert!(message.contains("4104-byte"));
        assert!(message.contains("alignment 8"));
    }
}
