use civpds_crypto::CryptoError;
use civpds_store::StoreError;
use civpds_types::TypeError;

/// Errors from the repository engine.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// No record at the path.
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// `create` on a path that already holds a record.
    #[error("record already exists: {0}")]
    RecordExists(String),

    /// Commit versions other than 2 and 3 are rejected.
    #[error("unsupported commit version {0}")]
    UnsupportedVersion(i64),

    /// The commit signature does not verify under the actor's key.
    #[error("commit signature does not verify for {0}")]
    BadSignature(String),

    /// The repository has no signed commit yet.
    #[error("repository has no commit")]
    NoCommit,

    /// A tree node failed to decode or violates tree invariants.
    #[error("malformed tree node: {0}")]
    MalformedNode(String),

    /// MST keys must be non-empty `<collection>/<rkey>` strings.
    #[error("invalid tree key {0:?}")]
    InvalidKey(String),

    /// A node needed for a mutation was not loaded first.
    #[error("tree node not loaded")]
    NotLoaded,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl RepoError {
    /// Returns `true` when a block the repository needed was missing.
    pub fn is_missing_block(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound(_)))
    }
}

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;
