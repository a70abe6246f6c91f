use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::pool::AllocFn;
use crate::{BufferPool, BufferRef, RawAllocator, ReusePolicy, allocator};

/// Builder for creating an instance of [`BufferPool`].
///
/// The buffer size is mandatory, whereas other settings are optional.
///
/// By default, buffers and their metadata are allocated from the global allocator. Use either
/// [`allocator()`][Self::allocator] to direct every allocation of the pool to a specific
/// [`RawAllocator`] or [`alloc_fn()`][Self::alloc_fn] to take full control over how new buffers
/// are created.
///
/// # Examples
///
/// ```
/// use shared_buffer::{BufferPool, BufferRef};
///
/// let pool = BufferPool::builder()
///     .buffer_size(1500)
///     .alloc_fn(BufferRef::alloc_zeroed)
///     .build();
///
/// assert!(pool.get().unwrap().iter().all(|byte| *byte == 0));
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct BufferPoolBuilder {
    buffer_size: Option<usize>,
    alloc_fn: Option<AllocFn>,
    allocator: Option<Arc<dyn RawAllocator>>,
    reuse_policy: ReusePolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl BufferPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            buffer_size: None,
            alloc_fn: None,
            allocator: None,
            reuse_policy: ReusePolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size in bytes of every buffer handed out by the pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_buffer::BufferPool;
    ///
    /// let pool = BufferPool::builder().buffer_size(256).build();
    /// assert_eq!(pool.get().unwrap().len(), 256);
    /// ```
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Sets the function the pool calls to create a new buffer when its free-list is empty.
    ///
    /// The function receives the buffer size of the pool and must return an exclusively owned,
    /// writable buffer of exactly that size whose view starts at the beginning of its storage
    /// (i.e. not a [`slice()`][BufferRef::slice] with a non-zero offset). When the pool is torn down, the buffers it created
    /// this way are released through whatever release strategy the function gave them.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_buffer::{BufferPool, BufferRef};
    ///
    /// let pool = BufferPool::builder()
    ///     .buffer_size(8)
    ///     .alloc_fn(|size| BufferRef::from_vec(vec![0xFF; size]))
    ///     .build();
    ///
    /// assert_eq!(&*pool.get().unwrap(), &[0xFF; 8]);
    /// ```
    pub fn alloc_fn<F>(mut self, alloc_fn: F) -> Self
    where
        F: Fn(usize) -> crate::Result<BufferRef> + Send + Sync + 'static,
    {
        let alloc_fn: AllocFn = Arc::new(alloc_fn);
        self.alloc_fn = Some(alloc_fn);
        self
    }

    /// Sets the allocator the pool takes buffer metadata from and, unless an
    /// [allocation function][Self::alloc_fn] is also set, the buffer storage itself.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use shared_buffer::{BufferPool, TrackingAllocator};
    ///
    /// let allocator = Arc::new(TrackingAllocator::new());
    /// let pool = BufferPool::builder()
    ///     .buffer_size(64)
    ///     .allocator(allocator.clone())
    ///     .build();
    ///
    /// drop(pool.get().unwrap());
    /// assert_eq!(allocator.live_allocations(), 1);
    ///
    /// drop(pool);
    /// assert_eq!(allocator.live_allocations(), 0);
    /// ```
    pub fn allocator(mut self, allocator: Arc<dyn RawAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets the [reuse policy][ReusePolicy] for the pool. This governs what happens to the
    /// contents of a recycled buffer before it is handed out again.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_buffer::{BufferPool, ReusePolicy};
    ///
    /// let pool = BufferPool::builder()
    ///     .buffer_size(64)
    ///     .reuse_policy(ReusePolicy::Zeroed)
    ///     .build();
    /// ```
    pub fn reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    /// Builds the buffer pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no buffer size has been set using [`buffer_size`](Self::buffer_size).
    #[must_use]
    pub fn build(self) -> BufferPool {
        let buffer_size = self
            .buffer_size
            .expect("buffer size must be set using .buffer_size() before calling .build()");

        let allocator = self.allocator.unwrap_or_else(allocator::global);

        let alloc_fn = self.alloc_fn.unwrap_or_else(|| {
            let allocator = Arc::clone(&allocator);
            let alloc_fn: AllocFn =
                Arc::new(move |size| BufferRef::alloc_in(size, Arc::clone(&allocator)));
            alloc_fn
        });

        BufferPool::new_inner(buffer_size, alloc_fn, allocator, self.reuse_policy)
    }
}

impl fmt::Debug for BufferPoolBuilder {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPoolBuilder")
            .field("buffer_size", &self.buffer_size)
            .field("alloc_fn", &self.alloc_fn.as_ref().map(|_| "custom"))
            .field("allocator", &self.allocator)
            .field("reuse_policy", &self.reuse_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::TrackingAllocator;

    assert_impl_all!(BufferPoolBuilder: Send, fmt::Debug);
    assert_not_impl_any!(BufferPoolBuilder: Sync);

    #[test]
    fn builder_applies_settings() {
        let pool = BufferPool::builder()
            .buffer_size(48)
            .reuse_policy(ReusePolicy::Zeroed)
            .build();

        assert_eq!(pool.buffer_size(), 48);
        assert_eq!(pool.get().unwrap().len(), 48);
    }

    #[test]
    #[should_panic]
    fn build_without_size_panics() {
        let _pool = BufferPool::builder().build();
    }

    #[test]
    fn allocator_is_used_for_storage_and_metadata() {
        let allocator = Arc::new(TrackingAllocator::new());
        let pool = BufferPool::builder()
            .buffer_size(32)
            .allocator(allocator.clone())
            .build();

        let buffer = pool.get().unwrap();
        assert_eq!(allocator.allocations(), 2);

        drop(buffer);
        drop(pool);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn alloc_fn_takes_precedence_over_allocator_for_storage() {
        let allocator = Arc::new(TrackingAllocator::new());
        let pool = BufferPool::builder()
            .buffer_size(32)
            .allocator(allocator.clone())
            .alloc_fn(BufferRef::alloc)
            .build();

        drop(pool.get().unwrap());
        assert_eq!(allocator.allocations(), 0);

        // Recycled buffers get their metadata from the allocator.
        let _buffer = pool.get().unwrap();
        assert_eq!(allocator.allocations(), 1);
    }

    #[test]
    fn debug_output_names_builder() {
        let builder = BufferPool::builder().buffer_size(8);
        assert!(format!("{builder:?}").starts_with("BufferPoolBuilder"));
    }
}
