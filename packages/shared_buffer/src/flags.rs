use std::ops::{BitOr, BitOrAssign};

/// Options applied to a buffer when it is created.
///
/// # Example
///
/// ```rust
/// use shared_buffer::BufferFlags;
///
/// let flags = BufferFlags::empty() | BufferFlags::READ_ONLY;
/// assert!(flags.contains(BufferFlags::READ_ONLY));
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct BufferFlags {
    bits: u8,
}

impl BufferFlags {
    /// The buffer contents may never be mutated in place, even by an exclusive owner.
    ///
    /// [`BufferRef::is_writable()`][crate::BufferRef::is_writable] always returns `false` for
    /// such buffers and copy-on-write operations always copy.
    pub const READ_ONLY: Self = Self { bits: 0b0000_0001 };

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Whether every flag in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            bits: self.bits | rhs.bits,
        }
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}
