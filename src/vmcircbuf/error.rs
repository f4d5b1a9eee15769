//! Error types for double-mapped allocation

/// Result type for allocator operations
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors produced while creating or probing double-mapped regions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The mechanism does not exist on this platform or was compiled out
    #[error("Backend '{0}' is not available on this platform")]
    Unavailable(String),

    /// An OS call failed while building the mapping
    #[error("Double-mapped allocation failed: {0}")]
    AllocationFailed(String),

    /// Requested size is zero or not a multiple of the mapping granularity
    #[error("Size {size} is not a positive multiple of the mapping granularity {granularity}")]
    InvalidSize { size: usize, granularity: usize },

    /// Every backend failed its self-test
    #[error("No working double-mapped memory backend found")]
    NoWorkingBackend,

    /// A backend produced a region whose halves do not mirror each other
    #[error("Self-test of backend '{backend}' failed: {reason}")]
    SelfTestFailed { backend: String, reason: String },
}

impl AllocError {
    /// Build an `AllocationFailed` from the last OS error
    pub(crate) fn last_os_error(what: &str) -> Self {
        let err = std::io::Error::last_os_error();
        AllocError::AllocationFailed(format!("{what}: {err}"))
    }
}
