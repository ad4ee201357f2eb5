use thiserror::Error;

/// Errors produced by type parsing and encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid tid: {0}")]
    InvalidTid(String),

    #[error("invalid did: {0}")]
    InvalidDid(String),

    #[error("invalid record path: {0}")]
    InvalidPath(String),

    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("cbor error: {0}")]
    Cbor(String),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

/// Result alias for type operations.
pub type TypeResult<T> = Result<T, TypeError>;
