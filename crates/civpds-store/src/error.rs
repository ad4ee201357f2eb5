use civpds_types::{Cid, TypeError};

/// Errors from block and object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested block was not found.
    #[error("block not found: {0}")]
    NotFound(Cid),

    /// Bytes read for a block do not hash to the requested CID.
    #[error("cid mismatch: expected {expected}, read {actual}")]
    CidMismatch { expected: Cid, actual: Cid },

    /// The requested object-storage key does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Malformed CAR framing.
    #[error("invalid car: {0}")]
    InvalidCar(String),

    /// A single CAR section exceeds the allocation limit.
    #[error("car section too large: {0} bytes")]
    SectionTooLarge(usize),

    /// Failure in a backing service (index database, task runtime).
    #[error("storage backend: {0}")]
    Backend(String),

    /// Write attempted against a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// Encoding or decoding failure.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns `true` for a missing block or object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::ObjectNotFound(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
