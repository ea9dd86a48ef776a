//! Integration tests for the `unordered_pool` package.
//!
//! These exercise the four pool variants through their public API: page accounting, reclamation
//! by `shrink()`, construct/destruct pairing and thread mobility.
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use new_zealand::nz;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use unordered_pool::{
    DEFAULT_PAGE_CAPACITY, EntryLifecycle, TypedUnorderedPool, TypedUnorderedTrivialPool,
    UnorderedPool, UnorderedPoolBuilder, UnorderedTrivialPool, UnorderedTrivialPoolBuilder,
};

assert_impl_all!(UnorderedTrivialPool: Send);
assert_not_impl_any!(UnorderedTrivialPool: Sync);
assert_impl_all!(UnorderedPool: Send);
assert_not_impl_any!(UnorderedPool: Sync);
assert_impl_all!(TypedUnorderedTrivialPool<[u8; 24]>: Send);
assert_not_impl_any!(TypedUnorderedTrivialPool<[u8; 24]>: Sync);
assert_impl_all!(TypedUnorderedPool<String>: Send);
assert_not_impl_any!(TypedUnorderedPool<String>: Sync);
assert_impl_all!(UnorderedPoolBuilder: Send);
assert_not_impl_any!(UnorderedPoolBuilder: Sync);
assert_impl_all!(UnorderedTrivialPoolBuilder: Send);
assert_not_impl_any!(UnorderedTrivialPoolBuilder: Sync);

const CAPACITY: u32 = 32;

/// A 24-byte entry whose destruction flips a shared flag.
struct Flagged {
    destructed: Option<Arc<AtomicBool>>,
    _payload: [u64; 2],
}

impl Default for Flagged {
    fn default() -> Self {
        Self {
            destructed: None,
            _payload: [0; 2],
        }
    }
}

impl Drop for Flagged {
    fn drop(&mut self) {
        if let Some(flag) = &self.destructed {
            assert!(
                !flag.swap(true, Ordering::Relaxed),
                "entry destructed more than once"
            );
        }
    }
}

#[test]
fn new_pools_have_no_pages() {
    assert_eq!(
        UnorderedTrivialPool::builder()
            .chunk_size(24)
            .build()
            .page_count(),
        0
    );
    assert_eq!(UnorderedPool::builder().chunk_size(24).build().page_count(), 0);
    assert_eq!(
        TypedUnorderedTrivialPool::<[u8; 24]>::new(nz!(CAPACITY)).page_count(),
        0
    );
    assert_eq!(TypedUnorderedPool::<Flagged>::new(nz!(CAPACITY)).page_count(), 0);
}

#[test]
fn default_page_capacity_applies_to_untyped_pools() {
    let pool = UnorderedPool::builder().chunk_layout_of::<u64>().build();
    assert_eq!(pool.page_capacity(), DEFAULT_PAGE_CAPACITY);
    assert_eq!(pool.chunk_size(), 8);
}

#[test]
fn acquire_page_count_for_every_variant() {
    let mut untyped_trivial = UnorderedTrivialPool::builder()
        .chunk_size(24)
        .page_capacity(nz!(CAPACITY))
        .build();
    let mut untyped = UnorderedPool::builder()
        .chunk_size(24)
        .page_capacity(nz!(CAPACITY))
        .build();
    let mut typed_trivial = TypedUnorderedTrivialPool::<[u8; 24]>::new(nz!(CAPACITY));
    let mut typed = TypedUnorderedPool::<Flagged>::new(nz!(CAPACITY));

    for index in 0..(2 * CAPACITY + 1) {
        _ = untyped_trivial.acquire().unwrap();
        _ = untyped.acquire().unwrap();
        _ = typed_trivial.acquire().unwrap();
        _ = typed.acquire().unwrap();

        let expected = 1 + index / CAPACITY;
        assert_eq!(untyped_trivial.page_count(), expected);
        assert_eq!(untyped.page_count(), expected);
        assert_eq!(typed_trivial.page_count(), expected);
        assert_eq!(typed.page_count(), expected);
    }
}

#[test]
fn shrink_scenario_with_24_byte_entries() {
    let mut pool = UnorderedTrivialPool::builder()
        .chunk_size(24)
        .page_capacity(nz!(CAPACITY))
        .build();

    let chunks: Vec<_> = (0..65).map(|_| pool.acquire().unwrap()).collect();
    assert_eq!(pool.page_count(), 3);

    // The first 64 chunks fill the first two pages.
    for chunk in &chunks[..64] {
        unsafe { pool.free(*chunk) };
    }

    pool.shrink();
    assert_eq!(pool.page_count(), 1);

    unsafe { pool.free(chunks[64]) };
    pool.shrink();
    assert_eq!(pool.page_count(), 0);
}

#[test]
fn shrink_never_releases_pages_with_live_entries() {
    let mut pool = TypedUnorderedPool::<Flagged>::new(nz!(CAPACITY));

    let entries: Vec<_> = (0..2 * CAPACITY).map(|_| pool.acquire().unwrap()).collect();
    let capacity = CAPACITY as usize;

    pool.shrink();
    assert_eq!(pool.page_count(), 2);

    // Free half of each page.
    for entry in entries[..capacity / 2]
        .iter()
        .chain(&entries[capacity..capacity + capacity / 2])
    {
        unsafe { pool.free(*entry) };
    }

    pool.shrink();
    assert_eq!(pool.page_count(), 2);

    for entry in &entries[capacity / 2..capacity] {
        unsafe { pool.free(*entry) };
    }

    pool.shrink();
    assert_eq!(pool.page_count(), 1);

    for entry in &entries[capacity + capacity / 2..] {
        unsafe { pool.free(*entry) };
    }

    pool.shrink();
    assert_eq!(pool.page_count(), 0);
}

#[test]
fn destructor_runs_on_free_not_before() {
    let mut pool = TypedUnorderedPool::<Flagged>::new(nz!(CAPACITY));
    let flag = Arc::new(AtomicBool::new(false));

    let mut entry = pool.acquire().unwrap();
    unsafe { entry.as_mut() }.destructed = Some(Arc::clone(&flag));

    // Other traffic does not touch the live entry.
    let others: Vec<_> = (0..40).map(|_| pool.acquire().unwrap()).collect();
    for other in others {
        unsafe { pool.free(other) };
    }
    pool.shrink();
    assert!(!flag.load(Ordering::Relaxed));

    unsafe { pool.free(entry) };
    assert!(flag.load(Ordering::Relaxed));
}

#[test]
fn drop_destructs_every_live_entry_once() {
    let flags: Vec<_> = (0..100).map(|_| Arc::new(AtomicBool::new(false))).collect();

    {
        let mut pool = TypedUnorderedPool::<Flagged>::new(nz!(CAPACITY));

        let entries: Vec<_> = flags
            .iter()
            .map(|flag| {
                let mut entry = pool.acquire().unwrap();
                unsafe { entry.as_mut() }.destructed = Some(Arc::clone(flag));
                entry
            })
            .collect();

        for entry in entries.iter().step_by(2) {
            unsafe { pool.free(*entry) };
        }

        for flag in flags.iter().skip(1).step_by(2) {
            assert!(!flag.load(Ordering::Relaxed));
        }
    }

    // Flagged asserts on a second destruction, so every flag being set means exactly once.
    assert!(flags.iter().all(|flag| flag.load(Ordering::Relaxed)));
}

#[test]
fn untyped_hooks_pair_up() {
    let constructed = Arc::new(AtomicUsize::new(0));
    let destructed = Arc::new(AtomicUsize::new(0));

    let mut pool = UnorderedPool::builder()
        .chunk_size(24)
        .page_capacity(nz!(CAPACITY))
        .constructor({
            let constructed = Arc::clone(&constructed);
            move |chunk: NonNull<u8>| {
                unsafe { chunk.write_bytes(0xC0, 24) };
                constructed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .destructor({
            let destructed = Arc::clone(&destructed);
            move |chunk: NonNull<u8>| {
                let bytes = unsafe { std::slice::from_raw_parts(chunk.as_ptr(), 24) };
                assert!(bytes.iter().all(|&byte| byte == 0xC0));
                destructed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build();

    let chunks: Vec<_> = (0..50).map(|_| pool.acquire().unwrap()).collect();

    for chunk in &chunks[10..] {
        unsafe { pool.free(*chunk) };
    }

    assert_eq!(constructed.load(Ordering::Relaxed), 50);
    assert_eq!(destructed.load(Ordering::Relaxed), 40);

    pool.clean();
    assert_eq!(destructed.load(Ordering::Relaxed), 50);
    assert_eq!(pool.page_count(), 0);
}

#[test]
fn trivial_bytes_round_trip() {
    let mut pool = TypedUnorderedTrivialPool::<[u8; 24]>::new(nz!(CAPACITY));

    let kept = pool.acquire().unwrap();
    let pattern: [u8; 24] = std::array::from_fn(|index| index as u8);
    unsafe { kept.write(pattern) };

    for round in 0..5 {
        let churn: Vec<_> = (0..70).map(|_| pool.acquire().unwrap()).collect();

        for chunk in &churn {
            unsafe { chunk.write([round; 24]) };
        }

        for chunk in churn {
            unsafe { pool.free(chunk) };
        }

        pool.shrink();
    }

    assert_eq!(unsafe { kept.read() }, pattern);
    assert_eq!(pool.page_count(), 1);
}

#[test]
fn no_page_drift_with_bounded_live_entries() {
    const PAGES: u32 = 4;

    let mut pool = TypedUnorderedTrivialPool::<u64>::new(nz!(CAPACITY));
    let mut live = Vec::new();

    for round in 0..50_usize {
        // Grow to the bound, then release a round-dependent share.
        while live.len() < (PAGES * CAPACITY) as usize {
            live.push(pool.acquire().unwrap());
        }

        let keep = round % live.len();
        for entry in live.drain(keep..) {
            unsafe { pool.free(entry) };
        }

        assert!(pool.page_count() <= PAGES);
    }
}

/// Lifecycle that counts constructions and destructions in process-wide counters.
struct Counting;

static COUNTING_CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);
static COUNTING_DESTRUCTED: AtomicUsize = AtomicUsize::new(0);

impl EntryLifecycle<[u64; 4]> for Counting {
    fn construct() -> [u64; 4] {
        COUNTING_CONSTRUCTED.fetch_add(1, Ordering::Relaxed);
        [7; 4]
    }

    fn destruct(entry: [u64; 4]) {
        assert_eq!(entry[0], 7);
        COUNTING_DESTRUCTED.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn custom_lifecycle_on_another_thread() {
    let pool = TypedUnorderedPool::<[u64; 4], Counting>::new(nz!(8));

    let pool = thread::spawn(move || {
        let mut pool = pool;

        let entries: Vec<_> = (0..20).map(|_| pool.acquire().unwrap()).collect();

        for entry in &entries[..10] {
            unsafe { pool.free(*entry) };
        }

        // Only this test uses the Counting lifecycle, so the counters are exact.
        assert_eq!(COUNTING_DESTRUCTED.load(Ordering::Relaxed), 10);
        pool
    })
    .join()
    .unwrap();

    assert_eq!(pool.page_count(), 3);
    drop(pool);

    assert_eq!(COUNTING_CONSTRUCTED.load(Ordering::Relaxed), 20);
    assert_eq!(COUNTING_DESTRUCTED.load(Ordering::Relaxed), 20);
}
