use civpds_carstore::CarStoreError;
use civpds_crypto::CryptoError;
use civpds_events::EventError;
use civpds_indexer::IndexerError;
use civpds_repo::RepoError;
use civpds_store::StoreError;
use civpds_types::{Did, TypeError, Uid};

/// Errors from the repo manager.
#[derive(Debug, thiserror::Error)]
pub enum RepoMgrError {
    /// The actor has no repository.
    #[error("no repo for actor {0}")]
    NoRepo(Uid),

    /// `init_new_repo` on an actor that already has one.
    #[error("actor {0} already has a repo")]
    RepoExists(Uid),

    /// Writes to a taken-down actor are refused.
    #[error("actor {0} is taken down")]
    TakenDown(Uid),

    /// The actor is not registered in the actor directory.
    #[error("unknown actor {0}")]
    UnknownActor(Uid),

    /// A repository's commit names a different DID than the actor.
    #[error("repo belongs to {found}, expected {expected}")]
    DidMismatch { expected: Did, found: Did },

    /// Account lifecycle operations need a key manager and directory client.
    #[error("account management is not configured")]
    NoAccounts,

    #[error(transparent)]
    CarStore(#[from] CarStoreError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl RepoMgrError {
    /// Returns `true` when a block needed for the operation was missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::CarStore(e) => e.is_not_found(),
            Self::Repo(e) => e.is_missing_block(),
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<RepoMgrError> for IndexerError {
    fn from(e: RepoMgrError) -> Self {
        if e.is_not_found() {
            IndexerError::MissingBlock(e.to_string())
        } else {
            IndexerError::Apply(e.to_string())
        }
    }
}

/// Result alias for repo manager operations.
pub type RepoMgrResult<T> = Result<T, RepoMgrError>;
