use thiserror::Error;

/// Errors that can occur when allocating or resizing buffers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An allocation step failed. This may have been the buffer storage itself, the shared
    /// metadata that tracks its reference count or the recycling bookkeeping of a pool.
    ///
    /// Nothing is leaked when this is returned: any storage allocated before the failing step
    /// has already been released again.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// The number of bytes requested by the step that failed.
        requested: usize,
    },
}

/// A specialized `Result` type for buffer operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn out_of_memory_mentions_requested_size() {
        let error = Error::OutOfMemory { requested: 4096 };

        assert_eq!(
            error.to_string(),
            "out of memory: failed to allocate 4096 bytes"
        );
    }
}
