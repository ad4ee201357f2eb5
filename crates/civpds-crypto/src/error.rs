use civpds_store::StoreError;
use civpds_types::{Did, TypeError};

/// Errors from key management and signing.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No key material exists for the actor.
    #[error("no signing key for {0}")]
    NoSigningKey(Did),

    /// Error reported by the KMS, passed through unchanged.
    #[error("kms: {0}")]
    Kms(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature")]
    InvalidSignature,

    /// The directory server could not be reached or refused a request.
    #[error("directory: {0}")]
    Directory(String),

    #[error("invalid did:key {0}")]
    InvalidDidKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
