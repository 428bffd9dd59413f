use std::io;

#[derive(Debug, thiserror::Error)]
/// An error surfaced by a page cache operation.
pub enum CacheError {
    #[error("insufficient resources")]
    /// A required resource (e.g. the worker thread) could not be acquired.
    InsufficientResources,
    #[error("resource in use")]
    /// A virtual-address detach was refused because the entry's reference
    /// count or dirty state makes it unsafe.
    ResourceInUse,
    #[error("try again")]
    /// A flush was voluntarily aborted so the caller can re-trim the cache
    /// before continuing.
    TryAgain,
    #[error("short write: {written} of {expected} bytes")]
    /// The non-cached write path completed fewer bytes than requested.
    DataLengthMismatch {
        /// Bytes the writer actually completed.
        written: usize,
        /// Bytes the flush asked for.
        expected: usize,
    },
    #[error("{0}")]
    /// A transport error from the non-cached write path or the memory
    /// provider, propagated unchanged.
    Io(#[from] io::Error),
}

impl CacheError {
    #[inline]
    /// Returns `true` if this is the cooperative [CacheError::TryAgain]
    /// signal rather than a real failure.
    pub fn is_try_again(&self) -> bool {
        matches!(self, CacheError::TryAgain)
    }
}
