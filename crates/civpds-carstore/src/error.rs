use civpds_store::StoreError;
use civpds_types::{Cid, Tid, TypeError, Uid};

/// Errors from the sharded CAR store.
#[derive(Debug, thiserror::Error)]
pub enum CarStoreError {
    /// A delta session was requested against a rev that is no longer current.
    #[error("stale write for actor {actor}: expected rev {expected:?}, current {current:?}")]
    StaleRev {
        actor: Uid,
        expected: Option<Tid>,
        current: Option<Tid>,
    },

    /// The actor has no shards.
    #[error("no repo for actor {0}")]
    NoRepo(Uid),

    /// A commit rev did not advance past the previous shard's rev.
    #[error("rev {next} does not advance past {prev}")]
    RevRegression { prev: Tid, next: Tid },

    /// The root passed to `close_with_root` is not among the session's blocks.
    #[error("root {0} not written in this session")]
    MissingRoot(Cid),

    /// Write attempted on a read-only session.
    #[error("session is read-only")]
    ReadOnly,

    /// Stored data disagrees with the index.
    #[error("corrupt shard {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// A blocking task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

impl CarStoreError {
    /// Returns `true` for a missing block.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

impl From<CarStoreError> for StoreError {
    fn from(e: CarStoreError) -> Self {
        match e {
            CarStoreError::Store(inner) => inner,
            CarStoreError::ReadOnly => StoreError::ReadOnly,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Result alias for CAR store operations.
pub type CarStoreResult<T> = Result<T, CarStoreError>;
