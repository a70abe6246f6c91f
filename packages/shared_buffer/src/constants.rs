/// Alignment of buffer storage obtained from a [`RawAllocator`][crate::RawAllocator].
///
/// Large enough for the vector loads that codecs typically run over buffer contents.
pub(crate) const STORAGE_ALIGNMENT: usize = 16;

/// Reference counts above this are treated as a leak of handles and abort the process,
/// mirroring the overflow guard of `std::sync::Arc`.
pub(crate) const MAX_REF_COUNT: usize = isize::MAX.unsigned_abs();

pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - buffer pool state \
    cannot be trusted after a panic while the free-list was locked";
