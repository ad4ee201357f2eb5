use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] civpds_store::StoreError),

    #[error("car store error: {0}")]
    CarStore(#[from] civpds_carstore::CarStoreError),

    #[error("key error: {0}")]
    Crypto(#[from] civpds_crypto::CryptoError),

    #[error("event error: {0}")]
    Event(#[from] civpds_events::EventError),

    #[error("indexer error: {0}")]
    Indexer(#[from] civpds_indexer::IndexerError),

    #[error("repo error: {0}")]
    RepoMgr(#[from] civpds_repomgr::RepoMgrError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
