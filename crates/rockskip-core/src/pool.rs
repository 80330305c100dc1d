//! Indexing workers and the wait-map that de-duplicates index requests.
//!
//! Repositories are sharded across workers by name, so runs for one
//! repository are serial while different repositories index in parallel.
//! Each worker owns a bounded queue; a full queue rejects the request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rockskip_indexer::Indexer;
use rockskip_indexer::store::repo_key;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::error::SearchError;
use crate::status::{OperationKind, Status};
use crate::telemetry;

/// `None` while the run is pending, then the number of commits indexed or
/// the reason the run failed.
pub type Completion = Option<Result<usize, String>>;

struct IndexJob {
    repo: String,
    commit: String,
    done: watch::Sender<Completion>,
}

type WaitMap = Arc<Mutex<HashMap<String, watch::Receiver<Completion>>>>;

pub struct IndexPool {
    workers: Vec<mpsc::Sender<IndexJob>>,
    waiters: WaitMap,
}

fn wait_key(repo: &str, commit: &str) -> String {
    format!("{repo}@{commit}")
}

impl IndexPool {
    /// Spawn `workers` indexing tasks on the current runtime.
    pub fn spawn(indexer: Indexer, workers: usize, queue_size: usize, status: Status) -> Self {
        let waiters: WaitMap = Arc::default();
        let senders = (0..usize::max(1, workers))
            .map(|worker| {
                let (tx, rx) = mpsc::channel(usize::max(1, queue_size));
                tokio::spawn(run_worker(
                    worker,
                    rx,
                    indexer.clone(),
                    status.clone(),
                    waiters.clone(),
                ));
                tx
            })
            .collect();
        Self {
            workers: senders,
            waiters,
        }
    }

    fn shard(&self, repo: &str) -> usize {
        repo_key(repo) as u32 as usize % self.workers.len()
    }

    /// Subscribe to the completion of indexing `repo` at `commit`, enqueuing
    /// a run unless one is already in flight for the same pair.
    pub fn request(&self, repo: &str, commit: &str) -> Result<watch::Receiver<Completion>, SearchError> {
        let key = wait_key(repo, commit);
        let mut waiters = self.waiters.lock();
        if let Some(pending) = waiters.get(&key) {
            return Ok(pending.clone());
        }

        let (done, pending) = watch::channel(None);
        let job = IndexJob {
            repo: repo.to_string(),
            commit: commit.to_string(),
            done,
        };
        self.workers[self.shard(repo)].try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SearchError::QueueFull(repo.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                SearchError::Internal(anyhow::anyhow!("indexing worker stopped"))
            }
        })?;
        waiters.insert(key, pending.clone());
        Ok(pending)
    }

    /// Number of index requests currently in flight.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Block until the run behind `pending` finishes or `deadline` passes.
/// Giving up never cancels the run itself.
pub async fn wait(
    mut pending: watch::Receiver<Completion>,
    deadline: Instant,
) -> Result<usize, SearchError> {
    let completion = match timeout_at(deadline, pending.wait_for(Option::is_some)).await {
        Err(_) => return Err(SearchError::Timeout),
        Ok(Err(_)) => {
            return Err(SearchError::IndexingFailed {
                reason: "indexing worker stopped before finishing".to_string(),
            });
        }
        Ok(Ok(completion)) => completion.clone(),
    };
    match completion {
        Some(Ok(indexed)) => Ok(indexed),
        Some(Err(reason)) => Err(SearchError::IndexingFailed { reason }),
        None => Ok(0),
    }
}

async fn run_worker(
    worker: usize,
    mut jobs: mpsc::Receiver<IndexJob>,
    indexer: Indexer,
    status: Status,
    waiters: WaitMap,
) {
    while let Some(job) = jobs.recv().await {
        let operation = status.begin(OperationKind::Index, &job.repo, Some(&job.commit));
        let started = std::time::Instant::now();
        let result = indexer.index(&job.repo, &job.commit, &operation).await;
        drop(operation);

        let completion = match result {
            Ok(outcome) => {
                telemetry::record_index_run("ok", outcome.indexed);
                if outcome.indexed > 0 {
                    info!(
                        worker,
                        repo = %job.repo,
                        commit = %job.commit,
                        indexed = outcome.indexed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "index run finished"
                    );
                }
                Ok(outcome.indexed)
            }
            Err(err) => {
                telemetry::record_index_run("error", 0);
                warn!(
                    worker,
                    repo = %job.repo,
                    commit = %job.commit,
                    error = %err,
                    "index run failed"
                );
                Err(err.to_string())
            }
        };

        finish(&waiters, job, completion);
    }
}

/// Retire the wait-map entry and publish the completion under one lock, so
/// a request that observes the entry always gets a receiver that will see
/// this completion, and a request after it starts a fresh run.
fn finish(waiters: &WaitMap, job: IndexJob, completion: Result<usize, String>) {
    let mut waiters = waiters.lock();
    waiters.remove(&wait_key(&job.repo, &job.commit));
    job.done.send_replace(Some(completion));
}
