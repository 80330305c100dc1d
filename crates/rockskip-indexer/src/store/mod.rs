//! Durable state: the ancestry chain, symbol rows and repository metadata,
//! plus connection-scoped named locks.
//!
//! A [`Session`] corresponds to one dedicated backend connection. Locks and
//! transactions belong to the session that took them, so a top-level
//! search/index/evict operation checks out one session and keeps it until it
//! is done.

use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::StoreResult;
use crate::query::SymbolQuery;
use crate::types::{CommitId, CommitNode, HopColumn, RepoId, StoreStats, SymbolId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Lock domains. Read and Write share a namespace (shared vs exclusive);
/// Indexing lives in its own namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lock {
    Read,
    Write,
    Indexing,
}

pub(crate) const RW_NAMESPACE: i32 = 1;
pub(crate) const INDEXING_NAMESPACE: i32 = 2;

impl Lock {
    pub(crate) fn namespace(self) -> i32 {
        match self {
            Lock::Read | Lock::Write => RW_NAMESPACE,
            Lock::Indexing => INDEXING_NAMESPACE,
        }
    }

    pub(crate) fn shared(self) -> bool {
        matches!(self, Lock::Read)
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lock::Read => "read",
            Lock::Write => "write",
            Lock::Indexing => "indexing",
        };
        f.write_str(name)
    }
}

/// Stable 32-bit key for a repository name. Shared by every process that
/// talks to the same database, so it must not depend on per-process seeds.
pub fn repo_key(repo: &str) -> i32 {
    let digest = Sha256::digest(repo.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Check out a dedicated session.
    async fn session(&self) -> StoreResult<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send {
    /// Non-blocking acquire. Returns false when another session holds a
    /// conflicting lock.
    async fn try_lock(&mut self, lock: Lock, repo: &str) -> StoreResult<bool>;

    /// Blocking acquire. Locks stack: a session may take the same lock more
    /// than once and must release it as many times.
    async fn lock(&mut self, lock: Lock, repo: &str) -> StoreResult<()>;

    async fn unlock(&mut self, lock: Lock, repo: &str) -> StoreResult<()>;

    async fn begin(&mut self) -> StoreResult<()>;
    async fn commit(&mut self) -> StoreResult<()>;
    async fn rollback(&mut self) -> StoreResult<()>;

    /// Insert the repository if needed and set `last_accessed_at` to now.
    async fn touch_repo(&mut self, repo: &str) -> StoreResult<RepoId>;

    /// Id of a resident repository, without touching it.
    async fn find_repo(&mut self, repo: &str) -> StoreResult<Option<RepoId>>;

    async fn get_commit(&mut self, repo_id: RepoId, hash: &str) -> StoreResult<Option<CommitNode>>;

    async fn insert_commit(
        &mut self,
        repo_id: RepoId,
        hash: &str,
        height: u32,
        ancestor: CommitId,
    ) -> StoreResult<CommitId>;

    /// Ancestor chain from `commit` to the root, both inclusive. For
    /// [`CommitId::ROOT`] this is just `[ROOT]`.
    async fn get_hops(&mut self, commit: CommitId) -> StoreResult<Vec<CommitId>>;

    /// Append `commit` to `column` of every row of the repository whose
    /// `column` array intersects `hops`. Returns the number of rows touched.
    async fn append_hop(
        &mut self,
        repo_id: RepoId,
        hops: &[CommitId],
        column: HopColumn,
        commit: CommitId,
    ) -> StoreResult<u64>;

    /// Row for `(path, name)` whose `added` contains `hop` and whose
    /// `deleted` does not intersect `visible_at`.
    async fn find_symbol(
        &mut self,
        repo_id: RepoId,
        path: &str,
        name: &str,
        hop: CommitId,
        visible_at: &[CommitId],
    ) -> StoreResult<Option<SymbolId>>;

    async fn insert_symbol(
        &mut self,
        repo_id: RepoId,
        commit: CommitId,
        path: &str,
        name: &str,
    ) -> StoreResult<SymbolId>;

    /// Append `commit` to the `deleted` array of one row.
    async fn mark_deleted(&mut self, symbol: SymbolId, commit: CommitId) -> StoreResult<()>;

    /// Remove `commit` from both arrays of every row where it appears in
    /// both. Returns the number of rows pruned.
    async fn delete_redundant(&mut self, repo_id: RepoId, commit: CommitId) -> StoreResult<u64>;

    /// Distinct paths, in path order, holding at least one symbol visible at
    /// `hops` that satisfies `query`.
    async fn search_paths(
        &mut self,
        repo_id: RepoId,
        hops: &[CommitId],
        query: &SymbolQuery,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    /// Least recently accessed repository ranked beyond `max_repos`.
    async fn evictable_repo(&mut self, max_repos: usize) -> StoreResult<Option<String>>;

    /// 1-based recency rank (1 = most recently accessed), if resident.
    async fn repo_rank(&mut self, repo: &str) -> StoreResult<Option<usize>>;

    /// Delete all ancestry, symbol and metadata rows of `repo`.
    async fn delete_repo(&mut self, repo: &str) -> StoreResult<()>;

    async fn stats(&mut self) -> StoreResult<StoreStats>;
}
