/// Errors produced while crawling and indexing remote repositories.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// The dispatcher has shut down.
    #[error("crawl dispatcher closed")]
    Closed,

    #[error("crawl concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("invalid crawl rate {0} for {1}")]
    InvalidCrawlRate(f64, String),

    /// A block needed to apply a commit or import was absent.
    #[error("missing block: {0}")]
    MissingBlock(String),

    /// The remote host answered a repo fetch with a non-success status.
    #[error("repo fetch from {host} failed with status {status}")]
    Status { host: String, status: u16 },

    /// Applying fetched data to local storage failed.
    #[error("apply failed: {0}")]
    Apply(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IndexerError {
    /// Whether a full resync can repair this failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MissingBlock(_))
    }
}

/// Result alias for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;
