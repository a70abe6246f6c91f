use std::fmt;
use std::mem;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::constants::ERR_POISONED_LOCK;
use crate::header::{BufferHeader, Recycler, Storage};
use crate::{BufferFlags, BufferPoolBuilder, BufferRef, RawAllocator, ReusePolicy};

/// Creates the buffers a pool hands out when its free-list is empty.
pub(crate) type AllocFn = Arc<dyn Fn(usize) -> crate::Result<BufferRef> + Send + Sync>;

/// A recycling allocator for buffers of one fixed size.
///
/// [`get()`][Self::get] hands out [`BufferRef`]s that behave exactly like directly allocated
/// ones, except that when the last handle to such a buffer is released, its memory goes onto the
/// free-list of the pool instead of back to the allocator. The next `get()` takes the most
/// recently released buffer from the free-list (LIFO), only allocating when the free-list is
/// empty.
///
/// This type acts as a cloneable handle to a shared pool instance. The pool stays alive for as
/// long as any pool handle exists or any buffer it issued is still referenced. Releasing the
/// last pool handle with buffers still outstanding defers the teardown: the pool keeps accepting
/// buffers back and frees everything once the last one returns.
///
/// # Thread safety
///
/// This type is thread-safe. Buffers may be obtained on one thread and released on another.
///
/// # Example
///
/// ```rust
/// use shared_buffer::BufferPool;
///
/// let pool = BufferPool::new(1024);
///
/// let mut buffer = pool.get().unwrap();
/// buffer.get_mut().unwrap()[0] = 0xAB;
/// drop(buffer);
///
/// // The same memory comes back, contents included.
/// let buffer = pool.get().unwrap();
/// assert_eq!(buffer[0], 0xAB);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

/// The state of a pool, shared by every pool handle and by the header of every buffer the pool
/// currently has outstanding.
///
/// Entries on the free-list do not reference the pool, so dropping the last pool handle and the
/// last outstanding buffer always frees this, whichever of the two happens last.
struct PoolShared {
    buffer_size: usize,
    alloc_fn: AllocFn,
    reuse_policy: ReusePolicy,

    // Headers of recycled buffers are allocated here.
    metadata_allocator: Arc<dyn RawAllocator>,

    // Used as a LIFO stack.
    free_list: Mutex<Vec<Storage>>,

    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool of buffers of `buffer_size` bytes, allocated from the global allocator.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferPool;
    ///
    /// let pool = BufferPool::new(4096);
    /// assert_eq!(pool.buffer_size(), 4096);
    /// ```
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self::builder().buffer_size(buffer_size).build()
    }

    /// Returns a builder for creating a [`BufferPool`] with custom configuration.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::{BufferPool, ReusePolicy};
    ///
    /// let pool = BufferPool::builder()
    ///     .buffer_size(512)
    ///     .reuse_policy(ReusePolicy::Zeroed)
    ///     .build();
    /// ```
    pub fn builder() -> BufferPoolBuilder {
        BufferPoolBuilder::new()
    }

    pub(crate) fn new_inner(
        buffer_size: usize,
        alloc_fn: AllocFn,
        metadata_allocator: Arc<dyn RawAllocator>,
        reuse_policy: ReusePolicy,
    ) -> Self {
        debug!(buffer_size, ?reuse_policy, "creating buffer pool");

        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                alloc_fn,
                reuse_policy,
                metadata_allocator,
                free_list: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Hands out a buffer of [`buffer_size()`][Self::buffer_size] bytes.
    ///
    /// The most recently released buffer is reused if the free-list is not empty. Otherwise a
    /// new buffer is obtained from the allocation function of the pool. The returned handle is
    /// exclusively owned and writable.
    ///
    /// Whether a reused buffer still holds the contents written by its previous user depends on
    /// the [`ReusePolicy`] of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if a new buffer or the buffer
    /// metadata cannot be allocated. A buffer taken from the free-list stays there in that case.
    ///
    /// # Panics
    ///
    /// Panics if the allocation function returns a buffer that is shared with other handles,
    /// read-only, of a size other than [`buffer_size()`][Self::buffer_size] or a view that
    /// starts past the beginning of its storage.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferPool;
    ///
    /// let pool = BufferPool::new(64);
    ///
    /// let buffer = pool.get().unwrap();
    /// assert_eq!(buffer.len(), 64);
    /// assert_eq!(pool.outstanding(), 1);
    ///
    /// drop(buffer);
    /// assert_eq!(pool.outstanding(), 0);
    /// assert_eq!(pool.available(), 1);
    /// ```
    pub fn get(&self) -> crate::Result<BufferRef> {
        let recycled = self
            .shared
            .free_list
            .lock()
            .expect(ERR_POISONED_LOCK)
            .pop();

        let mut buffer = match recycled {
            Some(storage) => self.reuse(storage)?,
            None => self.allocate()?,
        };

        if self.shared.reuse_policy == ReusePolicy::Zeroed {
            if let Some(contents) = buffer.get_mut() {
                contents.fill(0);
            }
        }

        self.shared
            .outstanding
            .fetch_add(1, atomic::Ordering::Relaxed);

        Ok(buffer)
    }

    fn reuse(&self, storage: Storage) -> crate::Result<BufferRef> {
        trace!(buffer_size = self.shared.buffer_size, "reusing pooled buffer");

        let recycler: Arc<dyn Recycler> = self.shared.clone();

        let mut buffer = BufferRef::from_storage(
            storage,
            Some(recycler),
            BufferFlags::empty(),
            false,
            Arc::clone(&self.shared.metadata_allocator),
        )
        .map_err(|storage| {
            self.shared
                .free_list
                .lock()
                .expect(ERR_POISONED_LOCK)
                .push(storage);

            BufferHeader::out_of_memory()
        })?;

        buffer.truncate_to_storage_prefix(self.shared.buffer_size);

        Ok(buffer)
    }

    fn allocate(&self) -> crate::Result<BufferRef> {
        trace!(
            buffer_size = self.shared.buffer_size,
            "allocating new pooled buffer"
        );

        let mut buffer = (self.shared.alloc_fn)(self.shared.buffer_size)?;

        assert!(
            !buffer.is_read_only(),
            "buffer pool allocation function returned a read-only buffer"
        );
        assert_eq!(
            buffer.len(),
            self.shared.buffer_size,
            "buffer pool allocation function returned a buffer of the wrong size"
        );
        assert!(
            buffer.starts_at_storage(),
            "buffer pool allocation function returned a view that does not start at the beginning of its storage"
        );

        buffer.install_recycler(self.shared.clone());

        Ok(buffer)
    }

    /// Releases the creator's share of the pool.
    ///
    /// If no buffers are outstanding, the pool and every buffer on its free-list are freed
    /// before this returns (unless other clones of this pool handle exist). Otherwise the
    /// teardown happens when the last outstanding buffer is released.
    ///
    /// This is equivalent to dropping the pool handle.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferPool;
    ///
    /// let pool = BufferPool::new(64);
    /// let buffer = pool.get().unwrap();
    ///
    /// pool.uninit();
    ///
    /// // The buffer remains fully usable. The pool goes away together with it.
    /// assert_eq!(buffer.len(), 64);
    /// drop(buffer);
    /// ```
    pub fn uninit(self) {
        debug!(
            outstanding = self.outstanding(),
            available = self.available(),
            "uninitializing buffer pool"
        );

        drop(self);
    }

    /// Frees every buffer currently on the free-list and returns how many were freed.
    ///
    /// Outstanding buffers are unaffected and still return to the free-list when released.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferPool;
    ///
    /// let pool = BufferPool::new(64);
    /// drop(pool.get().unwrap());
    ///
    /// assert_eq!(pool.shrink_to_fit(), 1);
    /// assert_eq!(pool.available(), 0);
    /// ```
    pub fn shrink_to_fit(&self) -> usize {
        // Released outside the lock, as releasing may call into arbitrary release functions.
        let entries = mem::take(&mut *self.shared.free_list.lock().expect(ERR_POISONED_LOCK));
        let released = entries.len();
        drop(entries);

        debug!(released, "shrunk buffer pool free-list");

        released
    }

    /// The number of buffers issued by the pool that are still referenced.
    ///
    /// With other threads releasing buffers, the value may be outdated by the time it is
    /// inspected.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(atomic::Ordering::Relaxed)
    }

    /// The number of buffers on the free-list, ready to be reused without allocating.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.free_list.lock().expect(ERR_POISONED_LOCK).len()
    }

    /// The size in bytes of every buffer handed out by the pool.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }
}

impl fmt::Debug for BufferPool {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("reuse_policy", &self.shared.reuse_policy)
            .field("outstanding", &self.outstanding())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl Recycler for PoolShared {
    fn recycle(&self, storage: Storage) {
        self.free_list
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(storage);

        self.outstanding.fetch_sub(1, atomic::Ordering::Relaxed);

        trace!(buffer_size = self.buffer_size, "returned buffer to pool");
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let free_list = self
            .free_list
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        let released = free_list.len();
        free_list.clear();

        debug!(
            buffer_size = self.buffer_size,
            released, "tore down buffer pool"
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(
        clippy::indexing_slicing,
        reason = "we do not need to worry about these things when writing test code"
    )]

    use std::alloc::Layout;
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use static_assertions::assert_impl_all;
    use testing::{CallCounter, with_watchdog};

    use super::*;
    use crate::{Error, TrackingAllocator};

    assert_impl_all!(BufferPool: Send, Sync, Clone, fmt::Debug);

    /// Fails every allocation while switched on.
    #[derive(Debug)]
    struct SwitchedAllocator {
        failing: AtomicBool,
        tracker: TrackingAllocator,
    }

    impl SwitchedAllocator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(false),
                tracker: TrackingAllocator::new(),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, atomic::Ordering::Relaxed);
        }
    }

    // SAFETY: Every request is either refused or forwarded to a conforming allocator.
    unsafe impl RawAllocator for SwitchedAllocator {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            if self.failing.load(atomic::Ordering::Relaxed) {
                return None;
            }

            self.tracker.allocate(layout)
        }

        unsafe fn resize(
            &self,
            ptr: NonNull<u8>,
            layout: Layout,
            new_size: usize,
        ) -> Option<NonNull<u8>> {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.tracker.resize(ptr, layout, new_size) }
        }

        unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.tracker.free(ptr, layout) }
        }
    }

    fn tracked_pool(size: usize) -> (BufferPool, Arc<TrackingAllocator>) {
        let allocator = Arc::new(TrackingAllocator::new());
        let pool = BufferPool::builder()
            .buffer_size(size)
            .allocator(allocator.clone())
            .build();

        (pool, allocator)
    }

    #[test]
    fn released_buffer_is_reused_with_contents() {
        let pool = BufferPool::new(16);

        let mut buffer = pool.get().unwrap();
        buffer.get_mut().unwrap().copy_from_slice(b"marker-marker-ok");
        let address = buffer.as_ptr();
        drop(buffer);

        let buffer = pool.get().unwrap();
        assert_eq!(buffer.as_ptr(), address);
        assert_eq!(&*buffer, b"marker-marker-ok");
    }

    #[test]
    fn free_list_is_lifo() {
        let pool = BufferPool::new(8);

        let first = pool.get().unwrap();
        let second = pool.get().unwrap();
        let first_address = first.as_ptr();
        let second_address = second.as_ptr();

        drop(first);
        drop(second);
        assert_eq!(pool.available(), 2);

        assert_eq!(pool.get().unwrap().as_ptr(), second_address);

        // The buffer obtained above went straight back, so it is on top again.
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(a.as_ptr(), second_address);
        assert_eq!(b.as_ptr(), first_address);
    }

    #[test]
    fn outstanding_and_available_track_buffers() {
        let pool = BufferPool::new(8);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 0);

        let buffer = pool.get().unwrap();
        let clone = buffer.clone();
        assert_eq!(pool.outstanding(), 1);

        drop(buffer);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.available(), 0);

        drop(clone);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn pooled_buffers_are_exclusive_and_writable() {
        let pool = BufferPool::new(32);

        let buffer = pool.get().unwrap();
        assert_eq!(buffer.ref_count(), 1);
        assert!(buffer.is_writable());
        assert_eq!(buffer.len(), 32);
    }

    #[test]
    fn uninit_without_outstanding_frees_immediately() {
        let (pool, allocator) = tracked_pool(64);

        drop(pool.get().unwrap());
        drop(pool.get().unwrap());
        assert_eq!(pool.available(), 1);

        // Only the pooled storage is alive; its header went away with the handle.
        assert_eq!(allocator.live_allocations(), 1);

        pool.uninit();
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn uninit_with_outstanding_defers_teardown() {
        let (pool, allocator) = tracked_pool(64);

        let kept = pool.get().unwrap();
        drop(pool.get().unwrap());
        let deallocations_before = allocator.deallocations();

        pool.uninit();

        // Nothing was freed yet: the free-list entry waits for the outstanding buffer.
        assert_eq!(allocator.deallocations(), deallocations_before);
        assert_eq!(kept.len(), 64);

        drop(kept);
        assert_eq!(allocator.live_allocations(), 0);
        assert!(allocator.deallocations() > deallocations_before);
    }

    #[test]
    fn clones_share_one_pool() {
        let pool = BufferPool::new(8);
        let clone = pool.clone();

        drop(pool.get().unwrap());
        assert_eq!(clone.available(), 1);

        pool.uninit();
        assert_eq!(clone.get().unwrap().len(), 8);
    }

    #[test]
    fn zeroed_policy_clears_reused_buffers() {
        let pool = BufferPool::builder()
            .buffer_size(8)
            .reuse_policy(ReusePolicy::Zeroed)
            .build();

        let mut buffer = pool.get().unwrap();
        assert!(buffer.iter().all(|byte| *byte == 0));

        buffer.get_mut().unwrap().fill(0xFF);
        drop(buffer);

        let buffer = pool.get().unwrap();
        assert!(buffer.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn shrink_to_fit_releases_free_list_only() {
        let (pool, allocator) = tracked_pool(16);

        let kept = pool.get().unwrap();
        drop(pool.get().unwrap());
        drop(pool.get().unwrap());
        assert_eq!(pool.available(), 1);

        assert_eq!(pool.shrink_to_fit(), 1);
        assert_eq!(pool.available(), 0);

        // Storage and header of the outstanding buffer.
        assert_eq!(allocator.live_allocations(), 2);

        drop(kept);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn metadata_failure_keeps_entry_on_free_list() {
        let allocator = SwitchedAllocator::new();
        let pool = BufferPool::builder()
            .buffer_size(16)
            .allocator(allocator.clone())
            .build();

        drop(pool.get().unwrap());
        assert_eq!(pool.available(), 1);

        allocator.set_failing(true);
        let result = pool.get();
        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 0);

        allocator.set_failing(false);
        assert_eq!(pool.get().unwrap().len(), 16);
    }

    #[test]
    fn fresh_allocation_failure_is_reported() {
        let allocator = SwitchedAllocator::new();
        allocator.set_failing(true);

        let pool = BufferPool::builder()
            .buffer_size(16)
            .allocator(allocator.clone())
            .build();

        assert!(matches!(pool.get(), Err(Error::OutOfMemory { .. })));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(allocator.tracker.live_allocations(), 0);
    }

    #[test]
    fn custom_alloc_fn_is_called_only_when_free_list_is_empty() {
        let counter = CallCounter::new();
        let pool = BufferPool::builder()
            .buffer_size(24)
            .alloc_fn({
                let counter = counter.clone();
                move |size| {
                    counter.increment();
                    BufferRef::alloc_zeroed(size)
                }
            })
            .build();

        drop(pool.get().unwrap());
        drop(pool.get().unwrap());
        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();

        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn true_release_of_custom_buffers_runs_at_teardown() {
        let counter = CallCounter::new();
        let pool = BufferPool::builder()
            .buffer_size(4)
            .alloc_fn({
                let counter = counter.clone();
                move |size| {
                    let counter = counter.clone();
                    let mut backing = vec![0_u8; size];
                    let data = NonNull::new(backing.as_mut_ptr()).unwrap();

                    // SAFETY: The heap memory of the vector stays in place until the release
                    // function drops the vector.
                    unsafe {
                        BufferRef::from_raw_parts(
                            data,
                            size,
                            move |_, _| {
                                drop(backing);
                                counter.increment();
                            },
                            BufferFlags::empty(),
                        )
                    }
                }
            })
            .build();

        let buffer = pool.get().unwrap();
        drop(buffer);
        assert_eq!(counter.count(), 0);

        pool.uninit();
        assert_eq!(counter.count(), 1);
    }

    #[test]
    #[should_panic]
    fn alloc_fn_returning_shared_buffer_panics() {
        let keep = Arc::new(Mutex::new(Vec::new()));
        let pool = BufferPool::builder()
            .buffer_size(4)
            .alloc_fn(move |size| {
                let buffer = BufferRef::alloc(size)?;
                keep.lock().unwrap().push(buffer.clone());
                Ok(buffer)
            })
            .build();

        let _buffer = pool.get();
    }

    #[test]
    #[should_panic]
    fn alloc_fn_returning_wrong_size_panics() {
        let pool = BufferPool::builder()
            .buffer_size(4)
            .alloc_fn(|size| BufferRef::alloc(size + 1))
            .build();

        let _buffer = pool.get();
    }

    #[test]
    #[should_panic]
    fn alloc_fn_returning_offset_view_panics() {
        let pool = BufferPool::builder()
            .buffer_size(4)
            .alloc_fn(|size| Ok(BufferRef::alloc(size * 2)?.slice(size..)))
            .build();

        let _buffer = pool.get();
    }

    #[test]
    fn fresh_buffer_is_fully_readable() {
        let pool = BufferPool::new(64);

        let buffer = pool.get().unwrap();
        assert_eq!(buffer.iter().map(|byte| u32::from(*byte)).sum::<u32>(), 0);
    }

    #[test]
    fn recycled_buffer_covers_storage_prefix() {
        let pool = BufferPool::builder()
            .buffer_size(4)
            .alloc_fn(|size| BufferRef::from_vec(vec![9; size]))
            .build();

        drop(pool.get().unwrap());

        let reused = pool.get().unwrap();
        assert_eq!(&*reused, &[9; 4]);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn buffers_from_another_pool_return_there_after_teardown() {
        let inner = BufferPool::new(8);
        let outer = BufferPool::builder()
            .buffer_size(8)
            .alloc_fn({
                let inner = inner.clone();
                move |_| inner.get()
            })
            .build();

        drop(outer.get().unwrap());
        assert_eq!(outer.available(), 1);
        assert_eq!(inner.outstanding(), 1);
        assert_eq!(inner.available(), 0);

        outer.uninit();
        assert_eq!(inner.outstanding(), 0);
        assert_eq!(inner.available(), 1);
    }

    #[test]
    fn pooled_buffers_copy_on_realloc() {
        let pool = BufferPool::new(8);

        let mut slot = Some(pool.get().unwrap());
        assert_eq!(
            BufferRef::realloc(&mut slot, 16).unwrap(),
            crate::Reallocation::Copied
        );

        // The pooled buffer went back to the pool when it was replaced.
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn buffers_return_from_other_threads() {
        with_watchdog(|| {
            let pool = BufferPool::new(128);

            let handles: Vec<_> = (0..8)
                .map(|index| {
                    let pool = pool.clone();
                    thread::spawn(move || {
                        for _ in 0..100 {
                            let mut buffer = pool.get().unwrap();
                            buffer.get_mut().unwrap()[0] = index;

                            let shared = buffer.clone();
                            let reader = thread::spawn(move || shared[0]);
                            drop(buffer);

                            assert_eq!(reader.join().unwrap(), index);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(pool.outstanding(), 0);
            assert!(pool.available() <= 8);
        });
    }
}
