//! Example that demonstrates the usage shown in the package documentation.
//!
//! This shows how to use `TypedUnorderedPool` for values that need construction and cleanup,
//! and `UnorderedTrivialPool` for raw chunks whose size is only known at runtime.

use new_zealand::nz;
use unordered_pool::{TypedUnorderedPool, UnorderedTrivialPool};

fn main() {
    println!("=== Unordered Pool README Example ===");

    // Entries are created with String::default() and dropped when freed.
    let mut strings = TypedUnorderedPool::<String>::new(nz!(32));

    let mut entry = strings
        .acquire()
        .expect("host allocator has memory available");

    // SAFETY: The entry was constructed by the pool and we have exclusive access to it.
    unsafe { entry.as_mut() }.push_str("hello");

    // SAFETY: The entry is live and nobody is mutating it.
    let value = unsafe { entry.as_ref() };
    println!("Entry value: {value}");
    assert_eq!(value, "hello");

    println!("Pages after one acquire: {}", strings.page_count());

    // SAFETY: The entry was acquired from this pool and is not used after this call.
    unsafe { strings.free(entry) };

    strings.shrink();
    println!("Pages after free and shrink: {}", strings.page_count());
    assert_eq!(strings.page_count(), 0);

    // Raw chunks of a size chosen at runtime.
    let record_size = 40;
    let mut records = UnorderedTrivialPool::builder()
        .chunk_size(record_size)
        .page_capacity(nz!(64))
        .build();

    let chunks: Vec<_> = (0..100)
        .map(|_| records.acquire().expect("host allocator has memory available"))
        .collect();

    println!(
        "Acquired {} chunks of {} bytes across {} pages",
        chunks.len(),
        records.chunk_size(),
        records.page_count()
    );

    for chunk in chunks {
        // SAFETY: Each chunk was acquired from this pool and is not used after this call.
        unsafe { records.free(chunk) };
    }

    records.shrink();
    assert_eq!(records.page_count(), 0);

    println!("README example completed successfully!");
}
