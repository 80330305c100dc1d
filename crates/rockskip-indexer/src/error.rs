use thiserror::Error;

use crate::types::CommitId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown commit id {0}")]
    UnknownCommit(CommitId),

    #[error("commit {0} is already indexed")]
    DuplicateCommit(String),

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("transaction already in progress")]
    NestedTransaction,

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("lock {0} is not held by this session")]
    LockNotHeld(String),

    #[error("height {0} does not fit the ancestry table")]
    HeightOutOfRange(u32),

    #[error("session connection was closed")]
    Closed,

    #[error("no session became available within {0:?}")]
    SessionTimeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("git: {0:#}")]
    Git(anyhow::Error),

    #[error("failed to parse {path}: {source:#}")]
    Parse {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("ruler({height}) = {ruler} is out of range of len(hops) = {hops}")]
    RulerOutOfRange {
        height: u32,
        ruler: usize,
        hops: usize,
    },

    #[error("could not find symbol {name} in {path} while indexing {commit}")]
    MissingSymbol {
        path: String,
        name: String,
        commit: String,
    },

    #[error("commit {0} is too tall to index")]
    HeightOverflow(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
