//! Keeps the number of resident repositories within `max_repos` by
//! deleting the least recently accessed ones.

use std::sync::Arc;

use rockskip_indexer::{Lock, Session, Store, StoreResult};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::status::{OperationKind, Status};
use crate::telemetry;

/// Coalescing "a repository was touched" signal. At most one wake-up is
/// buffered; further notifications while one is pending are dropped.
#[derive(Clone)]
pub struct EvictorHandle {
    signal: mpsc::Sender<()>,
}

impl EvictorHandle {
    pub fn notify(&self) {
        let _ = self.signal.try_send(());
    }
}

pub fn channel() -> (EvictorHandle, mpsc::Receiver<()>) {
    let (signal, wakeups) = mpsc::channel(1);
    (EvictorHandle { signal }, wakeups)
}

pub struct Evictor {
    store: Arc<dyn Store>,
    max_repos: usize,
    status: Status,
}

impl Evictor {
    pub fn new(store: Arc<dyn Store>, max_repos: usize, status: Status) -> Self {
        Self {
            store,
            max_repos: usize::max(1, max_repos),
            status,
        }
    }

    /// Evict on every wake-up until all handles are dropped.
    pub async fn run(self: Arc<Self>, mut wakeups: mpsc::Receiver<()>) {
        while wakeups.recv().await.is_some() {
            if let Err(err) = self.evict_old_repos().await {
                warn!(error = %err, "eviction pass failed");
            }
        }
    }

    /// Delete repositories ranked beyond `max_repos`, least recently
    /// accessed first. Returns how many were deleted.
    pub async fn evict_old_repos(&self) -> StoreResult<usize> {
        let mut session = self.store.session().await?;
        let mut evicted = 0;
        while let Some(repo) = session.evictable_repo(self.max_repos).await? {
            let operation = self.status.begin(OperationKind::Evict, &repo, None);
            operation.set_phase("waiting for write lock");
            session.lock(Lock::Write, &repo).await?;
            operation.set_phase("waiting for indexing lock");
            if let Err(err) = session.lock(Lock::Indexing, &repo).await {
                session.unlock(Lock::Write, &repo).await?;
                return Err(err);
            }

            operation.set_phase("deleting");
            let deleted = self.evict_locked(session.as_mut(), &repo).await;
            session.unlock(Lock::Indexing, &repo).await?;
            session.unlock(Lock::Write, &repo).await?;

            if deleted? {
                evicted += 1;
                telemetry::record_eviction();
                info!(repo = %repo, max_repos = self.max_repos, "evicted repository");
            }
        }
        Ok(evicted)
    }

    /// Delete `repo` if it is still ranked beyond the budget. A concurrent
    /// access may have refreshed it, or another evictor deleted it already.
    async fn evict_locked(&self, session: &mut dyn Session, repo: &str) -> StoreResult<bool> {
        match session.repo_rank(repo).await? {
            Some(rank) if rank > self.max_repos => {}
            _ => return Ok(false),
        }
        session.begin().await?;
        if let Err(err) = session.delete_repo(repo).await {
            if let Err(rollback) = session.rollback().await {
                warn!(repo, error = %rollback, "rollback failed");
            }
            return Err(err);
        }
        session.commit().await?;
        Ok(true)
    }
}
