/// Creates and disposes of the entries of a [`TypedUnorderedPool`][crate::TypedUnorderedPool].
///
/// The pool calls [`construct()`][Self::construct] once for every acquired entry and
/// [`destruct()`][Self::destruct] once for every entry that is freed or still live when the pool
/// is cleaned or dropped.
///
/// # Example
///
/// ```rust
/// use new_zealand::nz;
/// use unordered_pool::{EntryLifecycle, TypedUnorderedPool};
///
/// struct Buffer(Vec<u8>);
///
/// struct PreallocatedBuffer;
///
/// impl EntryLifecycle<Buffer> for PreallocatedBuffer {
///     fn construct() -> Buffer {
///         Buffer(Vec::with_capacity(1024))
///     }
///
///     fn destruct(entry: Buffer) {
///         drop(entry);
///     }
/// }
///
/// let mut pool = TypedUnorderedPool::<Buffer, PreallocatedBuffer>::new(nz!(16));
/// let entry = pool.acquire().expect("host allocator has memory available");
///
/// // SAFETY: The entry is live and nothing else references it.
/// assert!(unsafe { entry.as_ref() }.0.capacity() >= 1024);
/// ```
pub trait EntryLifecycle<T> {
    /// Creates the value placed into a newly acquired chunk.
    fn construct() -> T;

    /// Disposes of a value whose chunk is being returned to the pool.
    fn destruct(entry: T);
}

/// Constructs entries with [`Default`] and disposes of them by dropping.
#[derive(Debug)]
pub struct DefaultLifecycle;

impl<T: Default> EntryLifecycle<T> for DefaultLifecycle {
    fn construct() -> T {
        T::default()
    }

    fn destruct(entry: T) {
        drop(entry);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn default_lifecycle_uses_default() {
        let value: Vec<u32> = <DefaultLifecycle as EntryLifecycle<Vec<u32>>>::construct();
        assert!(value.is_empty());
    }

    #[test]
    fn default_lifecycle_drops_on_destruct() {
        struct SetOnDrop(Rc<Cell<bool>>);

        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        // Option makes the entry type satisfy the Default bound.
        let dropped = Rc::new(Cell::new(false));
        let entry = Some(SetOnDrop(Rc::clone(&dropped)));
        <DefaultLifecycle as EntryLifecycle<Option<SetOnDrop>>>::destruct(entry);
        assert!(dropped.get());
    }
}
