//! The shared, reference-counted part of a buffer that every [`BufferRef`][crate::BufferRef]
//! aliasing it points to.

use std::alloc::Layout;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};

use crate::constants::{MAX_REF_COUNT, STORAGE_ALIGNMENT};
use crate::{BufferFlags, Error, RawAllocator};

/// Caller-supplied release function. The closure captures whatever context it needs.
pub(crate) type ReleaseFn = Box<dyn FnOnce(NonNull<u8>, usize) + Send>;

/// How the memory of a [`Storage`] is truly released.
pub(crate) enum Release {
    /// The memory came from `allocator` with `layout` and goes back to it.
    Deallocate {
        allocator: Arc<dyn RawAllocator>,
        layout: Layout,
    },

    /// The memory is owned by someone else, who is told via this function.
    Custom(ReleaseFn),

    /// The memory outlives every buffer, e.g. because it is `'static`.
    Nothing,
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deallocate { allocator, layout } => f
                .debug_struct("Deallocate")
                .field("allocator", allocator)
                .field("layout", layout)
                .finish(),
            Self::Custom(_) => f.write_str("Custom"),
            Self::Nothing => f.write_str("Nothing"),
        }
    }
}

/// One physical block of buffer memory together with the strategy that truly releases it.
///
/// Dropping a [`Storage`] runs its release strategy exactly once. This is also what a pool
/// keeps on its free-list: the storage moves there intact when its last handle is released and
/// moves back into a new buffer when the pool hands it out again.
#[derive(Debug)]
pub(crate) struct Storage {
    data: NonNull<u8>,
    len: usize,
    release: Release,
}

// SAFETY: The storage exclusively owns the memory block (or refers to `'static` memory) and the
// release strategy is itself `Send`, so nothing ties a storage to the thread that created it.
unsafe impl Send for Storage {}

impl Storage {
    /// Allocates `len` bytes of zeroed storage from `allocator`.
    ///
    /// Buffers expose their storage as `&[u8]`, so it must never contain uninitialized bytes.
    pub(crate) fn allocate(len: usize, allocator: Arc<dyn RawAllocator>) -> crate::Result<Self> {
        let layout = Layout::from_size_align(len, STORAGE_ALIGNMENT)
            .map_err(|_layout_error| Error::OutOfMemory { requested: len })?;

        let data = allocator
            .allocate(layout)
            .ok_or(Error::OutOfMemory { requested: len })?;

        let mut storage = Self {
            data,
            len,
            release: Release::Deallocate { allocator, layout },
        };
        storage.zero();

        Ok(storage)
    }

    /// # Safety
    ///
    /// `data` must be valid for reads of `len` bytes until `release` is called. If the buffer
    /// built on top is ever mutated, `data` must also be valid for writes.
    pub(crate) unsafe fn from_raw_parts(data: NonNull<u8>, len: usize, release: Release) -> Self {
        Self { data, len, release }
    }

    pub(crate) fn data(&self) -> NonNull<u8> {
        self.data
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Resizes the storage through the allocator it came from, preserving the common prefix.
    /// Bytes gained by growing are zeroed.
    ///
    /// On failure the storage is unchanged.
    pub(crate) fn resize(&mut self, new_len: usize) -> crate::Result<()> {
        // Only allocator-owned storage is ever flagged as reallocatable. Anything else
        // cannot be resized by us, which from the caller's point of view is an allocation
        // that could not be satisfied.
        let Release::Deallocate { allocator, layout } = &mut self.release else {
            return Err(Error::OutOfMemory { requested: new_len });
        };

        let new_layout = Layout::from_size_align(new_len, layout.align())
            .map_err(|_layout_error| Error::OutOfMemory { requested: new_len })?;

        // SAFETY: `data` was obtained from `allocator` with `layout` and we still own it.
        let data = unsafe { allocator.resize(self.data, *layout, new_len) }
            .ok_or(Error::OutOfMemory { requested: new_len })?;

        *layout = new_layout;

        if let Some(grown_by) = new_len.checked_sub(self.len) {
            // SAFETY: The resized block is valid for writes of `new_len` bytes, of which the
            // last `grown_by` start right after the preserved `self.len` bytes.
            unsafe {
                data.as_ptr().add(self.len).write_bytes(0, grown_by);
            }
        }

        self.data = data;
        self.len = new_len;

        Ok(())
    }

    /// Overwrites the entire storage with zeroes.
    ///
    /// Requires exclusive access, which `&mut self` proves as long as no buffer currently
    /// exposes this storage.
    pub(crate) fn zero(&mut self) {
        // SAFETY: The storage is valid for writes of `len` bytes and we have exclusive access.
        unsafe {
            self.data.as_ptr().write_bytes(0, self.len);
        }
    }

    /// Drops the release strategy without running it.
    ///
    /// Used when building a buffer over caller-provided memory fails: ownership of the memory
    /// stays with the caller, so it must not be released on their behalf.
    pub(crate) fn disarm(mut self) {
        self.release = Release::Nothing;
    }

    /// Makes the eventual release of this storage go to `recycler` first, with the current
    /// release strategy preserved for whenever the recycler decides to truly release it.
    pub(crate) fn route_through(&mut self, recycler: Arc<dyn Recycler>) {
        let original = mem::replace(&mut self.release, Release::Nothing);

        self.release = Release::Custom(Box::new(move |data, len| {
            // SAFETY: These are the same data and length the original strategy was guarding.
            let storage = unsafe { Self::from_raw_parts(data, len, original) };
            recycler.recycle(storage);
        }));
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        match mem::replace(&mut self.release, Release::Nothing) {
            Release::Deallocate { allocator, layout } => {
                // SAFETY: `data` was obtained from `allocator` with `layout` and we still own
                // it. The storage is being dropped so nobody can observe the freed memory.
                unsafe {
                    allocator.free(self.data, layout);
                }
            }
            Release::Custom(release) => release(self.data, self.len),
            Release::Nothing => {}
        }
    }
}

/// Something that can take back storage when the last handle to it is released, instead of the
/// storage being truly released.
///
/// Buffers are unaware of what happens with their storage afterwards. A pool implements this
/// by pushing the storage onto its free-list.
pub(crate) trait Recycler: Send + Sync {
    /// Takes ownership of storage whose last handle was just released.
    fn recycle(&self, storage: Storage);
}

/// The shared metadata of one buffer. Lives in memory obtained from `allocator` so that its
/// allocation can fail gracefully.
pub(crate) struct BufferHeader {
    ref_count: AtomicUsize,

    storage: Storage,

    // If set, the storage is handed here instead of being dropped.
    recycler: Option<Arc<dyn Recycler>>,

    flags: BufferFlags,

    // Whether the storage may be resized in place when the buffer is exclusively owned.
    reallocatable: bool,

    // The allocator this header itself lives in.
    allocator: Arc<dyn RawAllocator>,
}

impl BufferHeader {
    /// Places a new header with a reference count of 1 into memory from `allocator`.
    ///
    /// If the header cannot be allocated, the storage is handed back so the caller can decide
    /// whether it is to be released, recycled or left to its original owner.
    pub(crate) fn allocate(
        storage: Storage,
        recycler: Option<Arc<dyn Recycler>>,
        flags: BufferFlags,
        reallocatable: bool,
        allocator: Arc<dyn RawAllocator>,
    ) -> Result<NonNull<Self>, Storage> {
        let Some(memory) = allocator.allocate(Layout::new::<Self>()) else {
            return Err(storage);
        };

        let ptr = memory.cast::<Self>();

        // SAFETY: The memory was allocated with the layout of `Self`, so it is valid for writes
        // and properly aligned. It does not yet contain a value that would need dropping.
        unsafe {
            ptr.write(Self {
                ref_count: AtomicUsize::new(1),
                storage,
                recycler,
                flags,
                reallocatable,
                allocator,
            });
        }

        Ok(ptr)
    }

    /// The error reported when the header itself cannot be allocated.
    pub(crate) fn out_of_memory() -> Error {
        Error::OutOfMemory {
            requested: size_of::<Self>(),
        }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub(crate) fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub(crate) fn is_reallocatable(&self) -> bool {
        self.reallocatable
    }

    /// Routes the eventual release of the storage through `recycler`. If another recycler was
    /// already installed, it still gets the storage after `recycler` is done with it.
    pub(crate) fn install_recycler(&mut self, recycler: Arc<dyn Recycler>) {
        if let Some(previous) = self.recycler.take() {
            self.storage.route_through(previous);
        }

        self.recycler = Some(recycler);

        // Recycled storage must come back with the size it was issued with.
        self.reallocatable = false;
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count.load(atomic::Ordering::Acquire)
    }

    /// Whether exactly one handle references this header.
    ///
    /// When this returns `true` to the holder of that single handle, no other thread can still
    /// be accessing the header or its storage.
    pub(crate) fn is_unique(&self) -> bool {
        // Acquire synchronizes with the Release decrement of whichever handle was dropped
        // last, so all its accesses happen-before anything we do after seeing 1 here.
        self.ref_count.load(atomic::Ordering::Acquire) == 1
    }

    #[cfg_attr(test, mutants::skip)] // Reaching the limit takes longer than any test can run.
    pub(crate) fn increment(&self) {
        // Relaxed is enough: a new reference can only be created from an existing one, which
        // already guarantees the header is alive and visible to this thread.
        let previous = self.ref_count.fetch_add(1, atomic::Ordering::Relaxed);

        if previous > MAX_REF_COUNT {
            std::process::abort();
        }
    }

    /// Returns `true` if the caller released the last reference and must destroy the header.
    #[must_use]
    pub(crate) fn decrement(&self) -> bool {
        if self.ref_count.fetch_sub(1, atomic::Ordering::Release) != 1 {
            return false;
        }

        // Pairs with the Release above on every other thread, making all their accesses to
        // the storage happen-before the release strategy runs.
        atomic::fence(atomic::Ordering::Acquire);
        true
    }

    /// Releases the storage (to its recycler, if any) and then frees the header itself.
    ///
    /// # Safety
    ///
    /// The reference count must have just reached zero via [`decrement()`][Self::decrement]
    /// and `ptr` must not be used afterwards.
    pub(crate) unsafe fn destroy(ptr: NonNull<Self>) {
        // SAFETY: The caller guarantees nobody else references the header anymore, so we may
        // move the value out. The memory itself is freed below without dropping it again.
        let header = unsafe { ptr.read() };

        let Self {
            storage,
            recycler,
            allocator,
            ..
        } = header;

        match recycler {
            Some(recycler) => recycler.recycle(storage),
            None => drop(storage),
        }

        // SAFETY: The header memory came from this allocator with this layout and the value
        // in it was moved out above.
        unsafe {
            allocator.free(ptr.cast(), Layout::new::<Self>());
        }
    }
}
