#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Fixed-size chunk pools for workloads that allocate and free huge numbers of same-size objects.
//!
//! A pool obtains memory from the host allocator one page at a time, slices each page into
//! chunks of a fixed size and hands the chunks out in no particular order. Freed chunks are
//! threaded into an intrusive free list stored inside the chunks themselves, so the pool keeps
//! no bookkeeping structure besides two list heads and a page counter.
//!
//! Four pool variants share the same engine:
//!
//! | Pool                                | Chunk size             | Construct / destruct          |
//! |-------------------------------------|------------------------|-------------------------------|
//! | [`UnorderedTrivialPool`]            | configured at runtime  | none                          |
//! | [`UnorderedPool`]                   | configured at runtime  | stored callbacks              |
//! | [`TypedUnorderedTrivialPool<T>`]    | `size_of::<T>()`       | none (`T: Copy`)              |
//! | [`TypedUnorderedPool<T, L>`]        | `size_of::<T>()`       | [`EntryLifecycle<T>`] `L`     |
//!
//! # Memory management
//!
//! Pages are only returned to the host allocator by [`shrink()`][TypedUnorderedPool::shrink],
//! which releases pages that are entirely free, or by [`clean()`][TypedUnorderedPool::clean]
//! and dropping the pool, which release everything. Partially used pages are never compacted.
//!
//! # Example
//!
//! ```rust
//! use new_zealand::nz;
//! use unordered_pool::TypedUnorderedPool;
//!
//! let mut pool = TypedUnorderedPool::<String>::new(nz!(32));
//!
//! let mut entry = pool.acquire().expect("host allocator has memory available");
//!
//! // SAFETY: The entry was constructed by the pool and we have exclusive access to it.
//! unsafe { entry.as_mut() }.push_str("hi");
//! assert_eq!(pool.page_count(), 1);
//!
//! // SAFETY: The entry was acquired from this pool and is not used after this call.
//! unsafe { pool.free(entry) };
//!
//! pool.shrink();
//! assert_eq!(pool.page_count(), 0);
//! ```
//!
//! # Integrity checks
//!
//! Passing a foreign pointer to `free()` or freeing the same chunk twice is undefined behavior.
//! Builds with `debug_assertions` enabled, or with the `integrity_checks` cargo feature, verify
//! the structure of the pool on every operation and panic on such misuse.
//!
//! # Thread safety
//!
//! Pools are thread-mobile ([`Send`]) when their entries are, but never thread-safe ([`Sync`]).

mod builder;
mod engine;
mod error;
mod fields;
mod free_list;
mod lifecycle;
mod page;
mod pal;
mod typed_unordered_pool;
mod typed_unordered_trivial_pool;
mod unordered_pool;
mod unordered_trivial_pool;

pub use builder::*;
pub use error::*;
pub(crate) use fields::*;
pub use lifecycle::*;
pub(crate) use page::ChunkLayout;
pub use typed_unordered_pool::TypedUnorderedPool;
pub use typed_unordered_trivial_pool::TypedUnorderedTrivialPool;
pub use unordered_pool::UnorderedPool;
pub use unordered_trivial_pool::UnorderedTrivialPool;

/// Whether the structural pool integrity checks are compiled in.
pub(crate) const INTEGRITY_CHECKS: bool = cfg!(any(debug_assertions, feature = "integrity_checks"));
