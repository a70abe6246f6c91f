/// Determines what a [`BufferPool`][crate::BufferPool] does with the contents of a recycled
/// buffer before handing it out again.
///
/// By default, the contents are left as the previous user wrote them.
///
/// # Examples
///
/// ```
/// use shared_buffer::{BufferPool, ReusePolicy};
///
/// // The reuse policy is set at pool creation time.
/// let pool = BufferPool::builder()
///     .buffer_size(4096)
///     .reuse_policy(ReusePolicy::Zeroed)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReusePolicy {
    /// Buffers are handed out with whatever contents they had when last released. Freshly
    /// allocated buffers have whatever contents the allocation function gave them, which is
    /// all zeroes for the default one. This is the default.
    #[default]
    PreserveContents,

    /// Every buffer handed out by the pool, fresh or recycled, has all bytes set to zero.
    ///
    /// This costs a write over the whole buffer on every `get()` but guarantees data written by
    /// a previous user of the memory is never observed by the next one.
    Zeroed,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_preserves_contents() {
        assert_eq!(ReusePolicy::default(), ReusePolicy::PreserveContents);
    }
}
