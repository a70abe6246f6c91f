use std::fmt;
use std::mem;
use std::ops::{Bound, Deref, RangeBounds};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use tracing::trace;

use crate::allocator;
use crate::header::{BufferHeader, Recycler, Release, Storage};
use crate::{BufferFlags, RawAllocator};

/// A handle to a reference-counted byte buffer.
///
/// Any number of [`BufferRef`] instances may alias the same underlying buffer. Cloning a handle
/// is O(1) and does not copy the contents. Each handle has its own view of the buffer, which
/// may be a sub-range of it (see [`slice()`][Self::slice]).
///
/// When the last handle is dropped, the release strategy of the buffer runs exactly once. For
/// buffers allocated by this crate that means the memory goes back to the allocator it came
/// from; for buffers obtained from a [`BufferPool`][crate::BufferPool] it means the memory goes
/// back onto the free-list of that pool.
///
/// # Mutation
///
/// The contents are readable by every handle through [`Deref`]. Mutable access is only granted
/// while the buffer is exclusively owned (a single handle exists) and not read-only, which is
/// what [`get_mut()`][Self::get_mut] checks. [`make_writable()`][Self::make_writable] copies the
/// contents into a fresh buffer first if that is not the case.
///
/// # Thread safety
///
/// Handles are [`Send`] and [`Sync`]. The reference count is atomic, so clones may be dropped
/// on any thread.
///
/// # Example
///
/// ```rust
/// use shared_buffer::BufferRef;
///
/// let mut buffer = BufferRef::alloc_zeroed(1024).unwrap();
/// assert_eq!(buffer.ref_count(), 1);
/// assert!(buffer.is_writable());
///
/// buffer.get_mut().unwrap()[0] = 42;
///
/// let shared = buffer.clone();
/// assert_eq!(buffer.ref_count(), 2);
/// assert!(!buffer.is_writable());
/// assert_eq!(shared[0], 42);
///
/// drop(shared);
/// assert!(buffer.is_writable());
/// ```
pub struct BufferRef {
    header: NonNull<BufferHeader>,

    // The view of this handle, always within the storage of the header.
    data: NonNull<u8>,
    len: usize,
}

/// What [`BufferRef::realloc()`] did to satisfy the request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Reallocation {
    /// The slot was empty and a new reallocatable buffer was placed into it.
    Allocated,

    /// The buffer was exclusively owned and reallocatable, so its storage was resized without
    /// replacing the handle.
    ResizedInPlace,

    /// The buffer was shared or not reallocatable. A new reallocatable buffer received a copy of
    /// the common prefix and replaced the handle in the slot. Other handles to the old buffer
    /// are unaffected.
    Copied,

    /// The handle already had the requested size. Nothing was done.
    Unchanged,
}

impl BufferRef {
    /// Builds a handle over a new header for `storage`, with the view covering all of it.
    ///
    /// If the header cannot be allocated the storage is handed back untouched.
    pub(crate) fn from_storage(
        storage: Storage,
        recycler: Option<Arc<dyn Recycler>>,
        flags: BufferFlags,
        reallocatable: bool,
        allocator: Arc<dyn RawAllocator>,
    ) -> Result<Self, Storage> {
        let data = storage.data();
        let len = storage.len();

        let header = BufferHeader::allocate(storage, recycler, flags, reallocatable, allocator)?;

        Ok(Self { header, data, len })
    }

    fn allocate(
        size: usize,
        allocator: Arc<dyn RawAllocator>,
        reallocatable: bool,
    ) -> crate::Result<Self> {
        let storage = Storage::allocate(size, Arc::clone(&allocator))?;

        // Storage first, metadata second; on failure the storage is dropped, which frees it.
        Self::from_storage(
            storage,
            None,
            BufferFlags::empty(),
            reallocatable,
            allocator,
        )
        .map_err(|storage| {
            drop(storage);
            BufferHeader::out_of_memory()
        })
    }

    /// Allocates a buffer of `size` bytes from the global allocator.
    ///
    /// The contents start out as zeroes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if either the storage or the buffer metadata cannot be
    /// allocated. Nothing is leaked in that case.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let buffer = BufferRef::alloc(1024).unwrap();
    /// assert_eq!(buffer.len(), 1024);
    /// ```
    pub fn alloc(size: usize) -> crate::Result<Self> {
        Self::alloc_in(size, allocator::global())
    }

    /// Allocates a buffer of `size` zeroed bytes, taking both the storage and the buffer
    /// metadata from `allocator`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if either the storage or the buffer metadata cannot be
    /// allocated. Nothing is leaked in that case.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    ///
    /// use shared_buffer::{BufferRef, TrackingAllocator};
    ///
    /// let allocator = Arc::new(TrackingAllocator::new());
    /// let buffer = BufferRef::alloc_in(256, allocator.clone()).unwrap();
    ///
    /// // One block for the storage, one for the metadata.
    /// assert_eq!(allocator.live_allocations(), 2);
    /// ```
    pub fn alloc_in(size: usize, allocator: Arc<dyn RawAllocator>) -> crate::Result<Self> {
        Self::allocate(size, allocator, false)
    }

    /// Allocates a buffer of `size` bytes from the global allocator, with all bytes set to zero.
    ///
    /// Same as [`alloc()`][Self::alloc], for call sites that want to spell out that they rely
    /// on the contents being zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer cannot be allocated.
    pub fn alloc_zeroed(size: usize) -> crate::Result<Self> {
        Self::alloc(size)
    }

    /// Allocates a buffer from the global allocator holding a copy of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer cannot be allocated.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let buffer = BufferRef::copy_from_slice(b"hello").unwrap();
    /// assert_eq!(&*buffer, b"hello");
    /// ```
    pub fn copy_from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let buffer = Self::alloc(bytes.len())?;

        // SAFETY: The new buffer is exactly `bytes.len()` long and cannot overlap `bytes`.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.data.as_ptr(), bytes.len());
        }

        Ok(buffer)
    }

    /// Wraps memory owned by the caller without copying it.
    ///
    /// The reference count starts at 1. When the last handle is released, `release` is called
    /// exactly once with `data` and `len`. Anything the release function needs to do its job is
    /// captured by the closure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer metadata cannot be allocated. In that case
    /// `release` is dropped without being called and the memory remains owned by the caller.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `len` bytes until `release` is called. Unless
    /// [`BufferFlags::READ_ONLY`] is set, it must also be valid for writes, as exclusive owners
    /// of the buffer are allowed to mutate it.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::ptr::NonNull;
    ///
    /// use shared_buffer::{BufferFlags, BufferRef};
    ///
    /// let boxed: Box<[u8]> = vec![1, 2, 3].into_boxed_slice();
    /// let len = boxed.len();
    /// let data = NonNull::from(Box::leak(boxed)).cast::<u8>();
    ///
    /// // SAFETY: The leaked box stays valid until we rebuild and drop it in the release function.
    /// let buffer = unsafe {
    ///     BufferRef::from_raw_parts(
    ///         data,
    ///         len,
    ///         |data, len| {
    ///             // SAFETY: These are the parts of the box we leaked above.
    ///             drop(unsafe {
    ///                 Box::from_raw(std::ptr::slice_from_raw_parts_mut(data.as_ptr(), len))
    ///             });
    ///         },
    ///         BufferFlags::empty(),
    ///     )
    /// }
    /// .unwrap();
    ///
    /// assert_eq!(&*buffer, &[1, 2, 3]);
    /// ```
    pub unsafe fn from_raw_parts<F>(
        data: NonNull<u8>,
        len: usize,
        release: F,
        flags: BufferFlags,
    ) -> crate::Result<Self>
    where
        F: FnOnce(NonNull<u8>, usize) + Send + 'static,
    {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { Self::from_raw_parts_in(data, len, release, flags, allocator::global()) }
    }

    /// Wraps memory owned by the caller without copying it, allocating the buffer metadata
    /// from `allocator`.
    ///
    /// See [`from_raw_parts()`][Self::from_raw_parts] for details.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer metadata cannot be allocated. In that case
    /// `release` is dropped without being called and the memory remains owned by the caller.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw_parts()`][Self::from_raw_parts].
    pub unsafe fn from_raw_parts_in<F>(
        data: NonNull<u8>,
        len: usize,
        release: F,
        flags: BufferFlags,
        allocator: Arc<dyn RawAllocator>,
    ) -> crate::Result<Self>
    where
        F: FnOnce(NonNull<u8>, usize) + Send + 'static,
    {
        // SAFETY: Forwarding the caller's guarantees.
        let storage =
            unsafe { Storage::from_raw_parts(data, len, Release::Custom(Box::new(release))) };

        Self::from_storage(storage, None, flags, false, allocator).map_err(|storage| {
            storage.disarm();
            BufferHeader::out_of_memory()
        })
    }

    /// Takes ownership of the contents of a vector without copying them.
    ///
    /// Any spare capacity of the vector is released first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer metadata cannot be allocated. The vector
    /// is dropped in that case.
    pub fn from_vec(vec: Vec<u8>) -> crate::Result<Self> {
        let boxed = vec.into_boxed_slice();
        let len = boxed.len();
        let data = NonNull::from(Box::leak(boxed)).cast::<u8>();

        let release = Release::Custom(Box::new(|data: NonNull<u8>, len: usize| {
            // SAFETY: These are the parts of the boxed slice leaked above, which nobody else
            // references anymore once the release strategy runs.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data.as_ptr(), len)) });
        }));

        // SAFETY: The leaked box is valid for reads and writes until released.
        let storage = unsafe { Storage::from_raw_parts(data, len, release) };

        Self::from_storage(storage, None, BufferFlags::empty(), false, allocator::global())
            .map_err(|storage| {
                drop(storage);
                BufferHeader::out_of_memory()
            })
    }

    /// Wraps static memory without copying it. The buffer is always read-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the buffer metadata cannot be allocated.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let buffer = BufferRef::from_static(b"constant").unwrap();
    /// assert!(!buffer.is_writable());
    /// ```
    pub fn from_static(bytes: &'static [u8]) -> crate::Result<Self> {
        let data = NonNull::from(bytes).cast::<u8>();

        // SAFETY: Static memory is valid for reads forever and the read-only flag guarantees
        // nobody will write through the buffer.
        let storage = unsafe { Storage::from_raw_parts(data, bytes.len(), Release::Nothing) };

        Self::from_storage(
            storage,
            None,
            BufferFlags::READ_ONLY,
            false,
            allocator::global(),
        )
        .map_err(|_storage| BufferHeader::out_of_memory())
    }

    fn header(&self) -> &BufferHeader {
        // SAFETY: The header stays alive for as long as any handle to it exists.
        unsafe { self.header.as_ref() }
    }

    /// Grants exclusive access to the header.
    ///
    /// Only to be used while this handle is known to be the only one, e.g. right after it was
    /// created or after [`BufferHeader::is_unique()`] returned `true`.
    fn header_mut_unchecked(&mut self) -> &mut BufferHeader {
        debug_assert!(self.header().is_unique());

        // SAFETY: The header is alive while we exist and the caller ensures no other handle
        // exists, so nobody else can be accessing it.
        unsafe { self.header.as_mut() }
    }

    /// Routes the release of this buffer through `recycler`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is shared with other handles.
    pub(crate) fn install_recycler(&mut self, recycler: Arc<dyn Recycler>) {
        assert!(
            self.header().is_unique(),
            "only an exclusively owned buffer can be handed over to a recycler"
        );

        self.header_mut_unchecked().install_recycler(recycler);
    }

    /// Narrows the view of this handle to the first `len` bytes of its storage.
    pub(crate) fn truncate_to_storage_prefix(&mut self, len: usize) {
        let (data, storage_len) = {
            let storage = self.header().storage();
            (storage.data(), storage.len())
        };

        self.data = data;
        self.len = len.min(storage_len);
    }

    /// Whether the view of this handle begins at the first byte of its storage.
    pub(crate) fn starts_at_storage(&self) -> bool {
        self.data == self.header().storage().data()
    }

    /// The number of bytes in the view of this handle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view of this handle is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A pointer to the first byte of the view of this handle.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// The number of handles currently referencing the same buffer.
    ///
    /// Always at least 1 because `self` is one of them. With other threads holding handles,
    /// the value may be outdated by the time it is inspected.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.header().ref_count()
    }

    /// Whether the buffer was created read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.header().flags().contains(BufferFlags::READ_ONLY)
    }

    /// Whether the contents may currently be mutated in place: this is the only handle to the
    /// buffer and the buffer is not read-only.
    ///
    /// Prefer [`get_mut()`][Self::get_mut], which performs this check and grants access in one
    /// step.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.is_read_only() && self.header().is_unique()
    }

    /// Returns mutable access to the view of this handle if the buffer
    /// [is writable][Self::is_writable], otherwise `None`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let mut buffer = BufferRef::alloc_zeroed(4).unwrap();
    /// buffer.get_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
    ///
    /// let other = buffer.clone();
    /// assert!(buffer.get_mut().is_none());
    ///
    /// drop(other);
    /// assert!(buffer.get_mut().is_some());
    /// ```
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if !self.is_writable() {
            return None;
        }

        // SAFETY: We are the only handle, which `&mut self` keeps true for the lifetime of the
        // returned slice, and the storage is not read-only so it is valid for writes.
        Some(unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) })
    }

    /// Returns mutable access to the view of this handle, first replacing the handle with a
    /// private copy of the view if the buffer is not [writable][Self::is_writable].
    ///
    /// Other handles to the original buffer are unaffected by the copy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if a copy was needed and could not be allocated. The
    /// handle is unchanged in that case.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let original = BufferRef::copy_from_slice(b"abc").unwrap();
    /// let mut copy = original.clone();
    ///
    /// copy.make_writable().unwrap()[0] = b'x';
    ///
    /// assert_eq!(&*original, b"abc");
    /// assert_eq!(&*copy, b"xbc");
    /// ```
    pub fn make_writable(&mut self) -> crate::Result<&mut [u8]> {
        if !self.is_writable() {
            let copy = Self::copy_from_slice(self)?;
            *self = copy;
        }

        // SAFETY: The handle is now exclusively owning a buffer that is not read-only and
        // `&mut self` keeps it that way for the lifetime of the returned slice.
        Ok(unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) })
    }

    /// Creates another handle to the same buffer whose view covers `range` of this handle's view.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds of this handle's view.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let buffer = BufferRef::copy_from_slice(b"hello world").unwrap();
    /// let world = buffer.slice(6..);
    ///
    /// assert_eq!(&*world, b"world");
    /// assert_eq!(buffer.ref_count(), 2);
    /// ```
    #[must_use]
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start.checked_add(1).expect("range start overflow"),
            Bound::Unbounded => 0,
        };

        let end = match range.end_bound() {
            Bound::Included(end) => end.checked_add(1).expect("range end overflow"),
            Bound::Excluded(end) => *end,
            Bound::Unbounded => self.len,
        };

        assert!(
            start <= end && end <= self.len,
            "slice range {start}..{end} out of bounds of view with length {}",
            self.len
        );

        let mut sliced = self.clone();

        // SAFETY: `start` is within the view, which is within the storage.
        sliced.data = unsafe { self.data.add(start) };
        sliced.len = end.wrapping_sub(start);

        sliced
    }

    /// Whether two handles reference the same buffer, regardless of their views.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.header == other.header
    }

    /// Releases the handle in `slot` (if any) and installs `new` (if any) in its place.
    ///
    /// The previous occupant is released exactly once, whether or not a replacement is given.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::BufferRef;
    ///
    /// let mut slot = Some(BufferRef::alloc(16).unwrap());
    ///
    /// BufferRef::replace(&mut slot, Some(BufferRef::alloc(32).unwrap()));
    /// assert_eq!(slot.as_ref().unwrap().len(), 32);
    ///
    /// BufferRef::replace(&mut slot, None);
    /// assert!(slot.is_none());
    /// ```
    pub fn replace(slot: &mut Option<Self>, new: Option<Self>) {
        drop(mem::replace(slot, new));
    }

    /// Releases the handle in `slot` (if any), leaving the slot empty.
    ///
    /// Equivalent to dropping the handle, for code that keeps handles in optional slots.
    pub fn unref(slot: &mut Option<Self>) {
        Self::replace(slot, None);
    }

    /// Resizes the buffer in `slot` to `new_size` bytes.
    ///
    /// * An empty slot receives a new reallocatable buffer.
    /// * A buffer that already has the requested size is left alone.
    /// * An exclusively owned buffer that was itself created by this function is resized in
    ///   place by the allocator it came from. The handle stays the same.
    /// * Anything else is replaced by a new reallocatable buffer holding a copy of the first
    ///   `min(old_size, new_size)` bytes. Other handles to the old buffer are unaffected.
    ///
    /// Bytes beyond the preserved prefix are zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the new size cannot be allocated. The slot is left
    /// unchanged in that case.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shared_buffer::{BufferRef, Reallocation};
    ///
    /// let mut slot = None;
    /// assert_eq!(BufferRef::realloc(&mut slot, 4).unwrap(), Reallocation::Allocated);
    ///
    /// slot.as_mut().unwrap().get_mut().unwrap().copy_from_slice(b"abcd");
    ///
    /// assert_eq!(
    ///     BufferRef::realloc(&mut slot, 1024).unwrap(),
    ///     Reallocation::ResizedInPlace
    /// );
    /// assert_eq!(&slot.as_ref().unwrap()[..4], b"abcd");
    /// ```
    pub fn realloc(slot: &mut Option<Self>, new_size: usize) -> crate::Result<Reallocation> {
        let Some(buffer) = slot.as_mut() else {
            *slot = Some(Self::allocate(new_size, allocator::global(), true)?);
            return Ok(Reallocation::Allocated);
        };

        if buffer.len == new_size {
            return Ok(Reallocation::Unchanged);
        }

        // A view starting past the beginning of the storage would lose its offset.
        if buffer.starts_at_storage() && buffer.header().is_reallocatable() && buffer.is_writable() {
            trace!(old_len = buffer.len, new_len = new_size, "resizing buffer in place");

            let storage = buffer.header_mut_unchecked().storage_mut();
            storage.resize(new_size)?;

            let data = storage.data();
            buffer.data = data;
            buffer.len = new_size;

            return Ok(Reallocation::ResizedInPlace);
        }

        trace!(
            old_len = buffer.len,
            new_len = new_size,
            "resizing buffer by copying"
        );

        let replacement = Self::allocate(new_size, allocator::global(), true)?;
        let preserved = buffer.len.min(new_size);

        // SAFETY: Both views are at least `preserved` bytes long and the replacement is a
        // distinct allocation, so they cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(buffer.data.as_ptr(), replacement.data.as_ptr(), preserved);
        }

        Self::replace(slot, Some(replacement));
        Ok(Reallocation::Copied)
    }
}

impl Clone for BufferRef {
    /// Creates another handle to the same buffer with the same view.
    ///
    /// This is O(1) and never copies the contents.
    fn clone(&self) -> Self {
        self.header().increment();

        Self {
            header: self.header,
            data: self.data,
            len: self.len,
        }
    }
}

impl Drop for BufferRef {
    /// Releases this handle. If it was the last one, the buffer is released as well.
    fn drop(&mut self) {
        if self.header().decrement() {
            // SAFETY: The reference count just reached zero, so no handle will access the
            // header ever again.
            unsafe { BufferHeader::destroy(self.header) };
        }
    }
}

impl Deref for BufferRef {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: The view is within the storage, which stays valid while any handle exists.
        // Mutation only happens through an exclusive handle, which this `&self` rules out.
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for BufferRef {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for BufferRef {}

impl PartialEq<[u8]> for BufferRef {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

impl fmt::Debug for BufferRef {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("len", &self.len)
            .field("ref_count", &self.ref_count())
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

// SAFETY: The reference count is atomic, the contents are only mutated through an exclusive
// handle and the release strategy is `Send` and runs on whichever thread drops the last handle.
unsafe impl Send for BufferRef {}

// SAFETY: Through `&BufferRef` only reads of the contents and atomic reference count updates are
// possible, both of which are safe to perform concurrently.
unsafe impl Sync for BufferRef {}
