//! The request-facing core: search, explicit indexing, status and eviction
//! over one store, with the indexing pool and evictor it owns.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rockskip_indexer::{
    CommitNode, Git, Indexer, Lock, RepoId, Session, Store, StoreResult, SymbolParser,
};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::config::RockskipConfig;
use crate::error::SearchError;
use crate::evictor::{self, Evictor, EvictorHandle};
use crate::pool::{self, IndexPool};
use crate::search::{self, QueryContext, SearchParams, SymbolMatch};
use crate::status::{OperationGuard, OperationKind, Status, StatusReport};
use crate::telemetry;

const READ_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub timeout: Duration,
    pub search_last_indexed_commit: bool,
    pub max_total_paths_length: usize,
    pub log_queries: bool,
}

impl From<&RockskipConfig> for ServerOptions {
    fn from(config: &RockskipConfig) -> Self {
        Self {
            timeout: config.timeout(),
            search_last_indexed_commit: config.search_last_indexed_commit,
            max_total_paths_length: config.max_total_paths_length,
            log_queries: config.log_queries,
        }
    }
}

#[derive(Clone)]
pub struct Server {
    store: Arc<dyn Store>,
    git: Arc<dyn Git>,
    parser: Arc<dyn SymbolParser>,
    pool: Arc<IndexPool>,
    evictor: Arc<Evictor>,
    evictor_handle: EvictorHandle,
    status: Status,
    options: ServerOptions,
}

impl Server {
    /// Build the server and spawn its indexing workers and evictor loop on
    /// the current runtime.
    pub fn spawn(
        store: Arc<dyn Store>,
        git: Arc<dyn Git>,
        parser: Arc<dyn SymbolParser>,
        config: &RockskipConfig,
    ) -> Self {
        let status = Status::new();
        let indexer = Indexer::new(
            store.clone(),
            git.clone(),
            parser.clone(),
            config.indexer_config(),
        );
        let pool = IndexPool::spawn(
            indexer,
            config.indexing_workers,
            config.index_queue_size,
            status.clone(),
        );
        let evictor = Arc::new(Evictor::new(store.clone(), config.max_repos, status.clone()));
        let (evictor_handle, wakeups) = evictor::channel();
        tokio::spawn(evictor.clone().run(wakeups));

        Self {
            store,
            git,
            parser,
            pool: Arc::new(pool),
            evictor,
            evictor_handle,
            status,
            options: ServerOptions::from(config),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Symbols matching `params` at the requested commit, indexing it first
    /// when needed.
    pub async fn search(&self, params: SearchParams) -> Result<Vec<SymbolMatch>, SearchError> {
        let result = self.search_inner(&params).await;
        match &result {
            Ok(matches) => telemetry::record_search("ok", matches.len()),
            Err(err) => {
                telemetry::record_search(err.outcome(), 0);
                debug!(repo = %params.repo, commit = %params.commit, error = %err, "search failed");
            }
        }
        result
    }

    async fn search_inner(&self, params: &SearchParams) -> Result<Vec<SymbolMatch>, SearchError> {
        let planned = params.plan()?;
        if self.options.log_queries {
            debug!(repo = %params.repo, query = ?planned.query, limit = planned.limit, "planned query");
        }
        let deadline = Instant::now() + params.timeout.unwrap_or(self.options.timeout);
        let repo = params.repo.as_str();
        let commit = params.commit.as_str();

        let operation = self.status.begin(OperationKind::Search, repo, Some(commit));
        operation.set_phase("acquiring read lock");
        let started = std::time::Instant::now();
        let mut session = self.read_session(repo).await?;
        telemetry::record_stage_latency("lock", started.elapsed().as_millis() as u64);

        let located = self.locate(session.as_mut(), repo, commit).await;
        let (mut session, repo_id, node) = match located {
            Ok((repo_id, Some(node))) => (session, repo_id, node),
            Ok((repo_id, None)) => {
                release_read(session, repo).await;
                let (session, node) = self
                    .index_and_wait(&operation, repo_id, repo, commit, deadline)
                    .await?;
                (session, repo_id, node)
            }
            Err(err) => {
                release_read(session, repo).await;
                return Err(err);
            }
        };

        operation.set_phase("querying");
        let ctx = QueryContext {
            git: self.git.as_ref(),
            parser: self.parser.as_ref(),
            max_total_paths_length: self.options.max_total_paths_length,
        };
        let result = timeout_at(
            deadline,
            search::execute(session.as_mut(), &ctx, repo, repo_id, &node, &planned),
        )
        .await
        .map_err(|_| SearchError::Timeout)
        .and_then(|found| found);
        release_read(session, repo).await;
        result
    }

    /// A fresh session holding Read on `repo`, or `RepositoryBusy` when a
    /// writer has it.
    async fn read_session(&self, repo: &str) -> Result<Box<dyn Session>, SearchError> {
        let mut session = self.store.session().await?;
        if !session.try_lock(Lock::Read, repo).await? {
            return Err(SearchError::RepositoryBusy(repo.to_string()));
        }
        Ok(session)
    }

    /// Touch `repo` and find the commit to search: `commit` itself, or with
    /// `search_last_indexed_commit` its nearest indexed ancestor while
    /// `commit` indexes in the background. `None` when the caller has to
    /// wait for indexing.
    async fn locate(
        &self,
        session: &mut dyn Session,
        repo: &str,
        commit: &str,
    ) -> Result<(RepoId, Option<CommitNode>), SearchError> {
        let repo_id = session.touch_repo(repo).await?;
        self.evictor_handle.notify();

        if let Some(node) = session.get_commit(repo_id, commit).await? {
            return Ok((repo_id, Some(node)));
        }
        if self.options.search_last_indexed_commit {
            if let Some(ancestor) = self.last_indexed_ancestor(session, repo_id, repo, commit).await? {
                info!(repo, commit, searched = %ancestor.hash, "searching last indexed commit");
                self.index_in_background(repo, commit);
                return Ok((repo_id, Some(ancestor)));
            }
        }
        Ok((repo_id, None))
    }

    /// Wait for `commit` to be indexed without holding a store session, then
    /// open a new one, take Read on it and look the commit up again.
    async fn index_and_wait(
        &self,
        operation: &OperationGuard,
        repo_id: RepoId,
        repo: &str,
        commit: &str,
        deadline: Instant,
    ) -> Result<(Box<dyn Session>, CommitNode), SearchError> {
        operation.set_phase("waiting for indexing");
        let started = std::time::Instant::now();
        let pending = self.pool.request(repo, commit)?;
        let indexed = pool::wait(pending, deadline).await?;
        telemetry::record_stage_latency("index_wait", started.elapsed().as_millis() as u64);
        debug!(repo, commit, indexed, "indexing finished");

        operation.set_phase("reacquiring read lock");
        let mut session = self.store.session().await?;
        acquire_read_until(session.as_mut(), repo, deadline).await?;

        match session.get_commit(repo_id, commit).await {
            Ok(Some(node)) => Ok((session, node)),
            Ok(None) => {
                release_read(session, repo).await;
                Err(SearchError::IndexingFailed {
                    reason: format!("commit {commit} of {repo} is not indexed after indexing finished; check the logs"),
                })
            }
            Err(err) => {
                release_read(session, repo).await;
                Err(err.into())
            }
        }
    }

    /// Nearest indexed first-parent ancestor of `commit`, excluding itself.
    async fn last_indexed_ancestor(
        &self,
        session: &mut dyn Session,
        repo_id: RepoId,
        repo: &str,
        commit: &str,
    ) -> Result<Option<CommitNode>, SearchError> {
        let mut revs = self.git.rev_list(repo, commit).skip(1);
        while let Some(hash) = revs.next().await {
            let hash = hash.map_err(|err| SearchError::Internal(err.context("failed to list ancestors")))?;
            if let Some(node) = session.get_commit(repo_id, &hash).await? {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    fn index_in_background(&self, repo: &str, commit: &str) {
        if let Err(err) = self.pool.request(repo, commit) {
            warn!(repo, commit, error = %err, "failed to enqueue background indexing");
        }
    }

    /// Index `repo` up to `commit` and wait for it. Returns the number of
    /// commits written, zero when the commit was already indexed.
    pub async fn index(
        &self,
        repo: &str,
        commit: &str,
        timeout: Option<Duration>,
    ) -> Result<usize, SearchError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.options.timeout);
        let mut session = self.read_session(repo).await?;
        let present = self.touch_and_check(session.as_mut(), repo, commit).await;
        release_read(session, repo).await;
        if present? {
            return Ok(0);
        }

        let pending = self.pool.request(repo, commit)?;
        pool::wait(pending, deadline).await
    }

    async fn touch_and_check(
        &self,
        session: &mut dyn Session,
        repo: &str,
        commit: &str,
    ) -> StoreResult<bool> {
        let repo_id = session.touch_repo(repo).await?;
        self.evictor_handle.notify();
        Ok(session.get_commit(repo_id, commit).await?.is_some())
    }

    /// In-flight operations and resident totals.
    pub async fn status(&self) -> Result<StatusReport, SearchError> {
        let mut session = self.store.session().await?;
        let totals = session.stats().await?;
        Ok(StatusReport {
            operations: self.status.snapshot(),
            totals,
        })
    }

    /// Run one eviction pass now instead of waiting for the next signal.
    pub async fn evict_old_repos(&self) -> StoreResult<usize> {
        self.evictor.evict_old_repos().await
    }

    /// Index requests currently in flight.
    pub fn pending_index_requests(&self) -> usize {
        self.pool.pending()
    }
}

/// Poll for Read until `deadline`, then give up with `Timeout`. Polling
/// keeps the session free of a blocking lock request that a timeout would
/// have to abandon.
async fn acquire_read_until(
    session: &mut dyn Session,
    repo: &str,
    deadline: Instant,
) -> Result<(), SearchError> {
    loop {
        if session.try_lock(Lock::Read, repo).await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(SearchError::Timeout);
        }
        sleep(READ_RETRY_INTERVAL.min(deadline - now)).await;
    }
}

async fn release_read(mut session: Box<dyn Session>, repo: &str) {
    if let Err(err) = session.unlock(Lock::Read, repo).await {
        warn!(repo, error = %err, "failed to release read lock");
    }
}

#[cfg(test)]
mod tests {
    use rockskip_indexer::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn read_reacquisition_times_out_behind_a_writer() {
        let store = MemoryStore::new();
        let mut writer = store.session().await.unwrap();
        writer.lock(Lock::Write, "repo").await.unwrap();

        let mut reader = store.session().await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(60);
        let err = acquire_read_until(reader.as_mut(), "repo", deadline).await.unwrap_err();
        assert!(matches!(err, SearchError::Timeout));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn read_is_reacquired_once_the_writer_leaves() {
        let store = MemoryStore::new();
        let mut writer = store.session().await.unwrap();
        writer.lock(Lock::Write, "repo").await.unwrap();

        let release = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            writer.unlock(Lock::Write, "repo").await.unwrap();
        });
        let mut reader = store.session().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        acquire_read_until(reader.as_mut(), "repo", deadline).await.unwrap();
        release.await.unwrap();
    }
}
