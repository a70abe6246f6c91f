//! Raw memory allocation primitives that buffer storage and metadata are obtained from.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, LazyLock};

/// A source of raw memory for buffers.
///
/// Every allocation a buffer performs goes through one of these: the storage of buffers created
/// by [`BufferRef::alloc_in()`][crate::BufferRef::alloc_in], the shared metadata that tracks the
/// reference count of every buffer and the storage resizing done by
/// [`BufferRef::realloc()`][crate::BufferRef::realloc].
///
/// Allocation failure is reported by returning `None`, never by aborting, which allows the
/// buffer layer to surface it as [`Error::OutOfMemory`][crate::Error::OutOfMemory].
///
/// # Safety
///
/// Pointers returned from [`allocate()`][Self::allocate] and [`resize()`][Self::resize] must be
/// valid for reads and writes of the requested number of bytes, aligned to the requested
/// alignment, and must remain valid until passed back to [`free()`][Self::free] or
/// [`resize()`][Self::resize] of the same allocator.
pub unsafe trait RawAllocator: Send + Sync + fmt::Debug {
    /// Allocates a block of memory matching `layout`.
    ///
    /// Zero-sized layouts must succeed with a dangling but well-aligned pointer.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Grows or shrinks a block of memory to `new_size` bytes, preserving the first
    /// `min(layout.size(), new_size)` bytes. The alignment is unchanged.
    ///
    /// On success the old pointer must no longer be used. On failure the old block is left
    /// untouched and remains owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for `layout` and not yet been freed.
    unsafe fn resize(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize)
    -> Option<NonNull<u8>>;

    /// Releases a block of memory.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for `layout` and not yet been freed.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default allocator, backed by the Rust global allocator.
///
/// # Example
///
/// ```rust
/// use std::alloc::Layout;
///
/// use shared_buffer::{Global, RawAllocator};
///
/// let layout = Layout::from_size_align(64, 16).unwrap();
/// let ptr = Global.allocate(layout).unwrap();
///
/// // SAFETY: The pointer came from this allocator with this layout.
/// unsafe { Global.free(ptr, layout) };
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Global;

// SAFETY: We forward to the Rust global allocator, which upholds the same contract for non-zero
// sizes. Zero-sized requests are answered with dangling pointers that are never dereferenced.
unsafe impl RawAllocator for Global {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return dangling(layout);
        }

        // SAFETY: The layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return self.allocate(Layout::from_size_align(new_size, layout.align()).ok()?);
        }

        if new_size == 0 {
            // SAFETY: Forwarding the caller's guarantee about `ptr` and `layout`.
            unsafe {
                self.free(ptr, layout);
            }
            return dangling(layout);
        }

        // The global allocator requires the new size to still form a valid layout.
        Layout::from_size_align(new_size, layout.align()).ok()?;

        // SAFETY: The caller guarantees `ptr` came from us with `layout`, both sizes are
        // non-zero and the new size was validated against the alignment above.
        NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), layout, new_size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        // SAFETY: The caller guarantees `ptr` came from us with `layout`.
        unsafe {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

fn dangling(layout: Layout) -> Option<NonNull<u8>> {
    NonNull::new(ptr::without_provenance_mut(layout.align()))
}

static GLOBAL: LazyLock<Arc<dyn RawAllocator>> = LazyLock::new(|| Arc::new(Global));

/// The shared instance of [`Global`] used whenever the caller does not supply an allocator.
pub(crate) fn global() -> Arc<dyn RawAllocator> {
    Arc::clone(&GLOBAL)
}

/// Wraps another [`RawAllocator`] and counts the operations performed through it.
///
/// This is useful for verifying that buffers and pools release everything they allocate, for
/// example in tests or when diagnosing a suspected leak. The counters are process-visible
/// immediately after each operation completes.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use shared_buffer::{BufferRef, TrackingAllocator};
///
/// let allocator = Arc::new(TrackingAllocator::new());
///
/// let buffer = BufferRef::alloc_in(1024, allocator.clone()).unwrap();
/// assert!(allocator.live_allocations() > 0);
///
/// drop(buffer);
/// assert_eq!(allocator.live_allocations(), 0);
/// assert_eq!(allocator.live_bytes(), 0);
/// ```
#[derive(Debug, Default)]
pub struct TrackingAllocator<A = Global> {
    inner: A,

    allocations: AtomicU64,
    deallocations: AtomicU64,
    resizes: AtomicU64,
    failures: AtomicU64,

    // Allocated minus freed bytes. Wrapping arithmetic keeps this lock-free; it can only
    // underflow if the inner allocator contract was violated.
    live_bytes: AtomicU64,
}

impl TrackingAllocator<Global> {
    /// Creates a tracking allocator over the [`Global`] allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::wrapping(Global)
    }
}

impl<A: RawAllocator> TrackingAllocator<A> {
    /// Creates a tracking allocator that forwards to `inner`.
    #[must_use]
    pub fn wrapping(inner: A) -> Self {
        Self {
            inner,
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
        }
    }

    /// Number of successful allocations so far.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(atomic::Ordering::Relaxed)
    }

    /// Number of blocks freed so far.
    #[must_use]
    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(atomic::Ordering::Relaxed)
    }

    /// Number of successful resizes so far.
    #[must_use]
    pub fn resizes(&self) -> u64 {
        self.resizes.load(atomic::Ordering::Relaxed)
    }

    /// Number of allocation or resize requests the inner allocator could not satisfy.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(atomic::Ordering::Relaxed)
    }

    /// Number of blocks allocated and not yet freed.
    #[must_use]
    pub fn live_allocations(&self) -> u64 {
        self.allocations().wrapping_sub(self.deallocations())
    }

    /// Number of bytes allocated and not yet freed.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(atomic::Ordering::Relaxed)
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, atomic::Ordering::Relaxed);
    }
}

// SAFETY: We forward every operation to an allocator that upholds the contract and only add
// bookkeeping on the side.
unsafe impl<A: RawAllocator> RawAllocator for TrackingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let Some(ptr) = self.inner.allocate(layout) else {
            self.record_failure();
            return None;
        };

        // Relaxed is sufficient: we only need atomicity, not ordering w.r.t. other memory ops.
        self.allocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.live_bytes
            .fetch_add(layout.size() as u64, atomic::Ordering::Relaxed);

        Some(ptr)
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding the caller's guarantee about `ptr` and `layout`.
        let Some(resized) = (unsafe { self.inner.resize(ptr, layout, new_size) }) else {
            self.record_failure();
            return None;
        };

        self.resizes.fetch_add(1, atomic::Ordering::Relaxed);
        self.live_bytes
            .fetch_sub(layout.size() as u64, atomic::Ordering::Relaxed);
        self.live_bytes
            .fetch_add(new_size as u64, atomic::Ordering::Relaxed);

        Some(resized)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantee about `ptr` and `layout`.
        unsafe {
            self.inner.free(ptr, layout);
        }

        self.deallocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.live_bytes
            .fetch_sub(layout.size() as u64, atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(
        clippy::indexing_slicing,
        reason = "we do not need to worry about these things when writing test code"
    )]

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Global: Send, Sync, Copy, fmt::Debug);
    assert_impl_all!(TrackingAllocator: Send, Sync, fmt::Debug);

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 16).expect("valid layout")
    }

    #[test]
    fn global_allocates_aligned_memory() {
        let ptr = Global.allocate(layout(100)).expect("allocation succeeds");
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        // SAFETY: Freshly allocated for this layout.
        unsafe { Global.free(ptr, layout(100)) };
    }

    #[test]
    fn global_zero_size_is_dangling_and_aligned() {
        let ptr = Global.allocate(layout(0)).expect("zero-size allocation succeeds");
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        // SAFETY: Freshly allocated for this layout. Freeing a zero-sized block is a no-op.
        unsafe { Global.free(ptr, layout(0)) };
    }

    #[test]
    fn global_resize_preserves_prefix() {
        let ptr = Global.allocate(layout(4)).expect("allocation succeeds");

        // SAFETY: We own the block and write within its bounds.
        unsafe { ptr.as_ptr().copy_from_nonoverlapping([1_u8, 2, 3, 4].as_ptr(), 4) };

        // SAFETY: The pointer came from this allocator with this layout.
        let grown = unsafe { Global.resize(ptr, layout(4), 4096) }.expect("resize succeeds");

        // SAFETY: The first four bytes were preserved by the resize.
        let prefix = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 4) };
        assert_eq!(prefix, &[1, 2, 3, 4]);

        // SAFETY: The grown block is now owned with the new layout.
        unsafe { Global.free(grown, layout(4096)) };
    }

    #[test]
    fn global_resize_from_and_to_zero() {
        let empty = Global.allocate(layout(0)).expect("zero-size allocation succeeds");

        // SAFETY: The pointer came from this allocator with this layout.
        let grown = unsafe { Global.resize(empty, layout(0), 32) }.expect("resize succeeds");

        // SAFETY: The pointer came from this allocator with the grown layout.
        let shrunk = unsafe { Global.resize(grown, layout(32), 0) }.expect("resize succeeds");

        // SAFETY: Zero-sized block, freeing is a no-op.
        unsafe { Global.free(shrunk, layout(0)) };
    }

    #[test]
    fn tracking_counts_every_operation() {
        let tracker = TrackingAllocator::new();

        let ptr = tracker.allocate(layout(64)).expect("allocation succeeds");
        assert_eq!(tracker.allocations(), 1);
        assert_eq!(tracker.live_bytes(), 64);

        // SAFETY: The pointer came from this allocator with this layout.
        let ptr = unsafe { tracker.resize(ptr, layout(64), 128) }.expect("resize succeeds");
        assert_eq!(tracker.resizes(), 1);
        assert_eq!(tracker.live_bytes(), 128);
        assert_eq!(tracker.live_allocations(), 1);

        // SAFETY: The pointer came from this allocator with the resized layout.
        unsafe { tracker.free(ptr, layout(128)) };
        assert_eq!(tracker.deallocations(), 1);
        assert_eq!(tracker.live_allocations(), 0);
        assert_eq!(tracker.live_bytes(), 0);
        assert_eq!(tracker.failures(), 0);
    }

    #[test]
    fn tracking_counts_failures() {
        let tracker = TrackingAllocator::new();

        // A size this large cannot form a valid resized layout.
        let ptr = tracker.allocate(layout(8)).expect("allocation succeeds");

        // SAFETY: The pointer came from this allocator with this layout.
        let resized = unsafe { tracker.resize(ptr, layout(8), usize::MAX) };
        assert!(resized.is_none());
        assert_eq!(tracker.failures(), 1);
        assert_eq!(tracker.live_bytes(), 8);

        // SAFETY: The failed resize left the original block owned by us.
        unsafe { tracker.free(ptr, layout(8)) };
    }
}
