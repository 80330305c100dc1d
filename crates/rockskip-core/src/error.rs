use rockskip_indexer::{IndexError, StoreError};
use thiserror::Error;

/// Failures a search or index caller can tell apart.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The repository is being deleted; retry later.
    #[error("repository {0} is busy (deletion in progress), retry")]
    RepositoryBusy(String),

    #[error("indexing queue is full for {0}")]
    QueueFull(String),

    #[error("indexing failed: {reason}")]
    IndexingFailed { reason: String },

    #[error("timed out")]
    Timeout,

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SearchError {
    /// Whether the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::RepositoryBusy(_) | SearchError::QueueFull(_) | SearchError::Timeout
        )
    }

    /// Metric label for the outcome of a request that failed this way.
    pub fn outcome(&self) -> &'static str {
        match self {
            SearchError::RepositoryBusy(_) => "busy",
            SearchError::QueueFull(_) => "queue_full",
            SearchError::IndexingFailed { .. } => "indexing_failed",
            SearchError::Timeout => "timeout",
            SearchError::InvalidPattern(_) => "invalid_pattern",
            SearchError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for SearchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPattern(err) => SearchError::InvalidPattern(err.to_string()),
            other => SearchError::Internal(other.into()),
        }
    }
}

impl From<IndexError> for SearchError {
    fn from(err: IndexError) -> Self {
        SearchError::IndexingFailed {
            reason: err.to_string(),
        }
    }
}

impl From<regex::Error> for SearchError {
    fn from(err: regex::Error) -> Self {
        SearchError::InvalidPattern(err.to_string())
    }
}
