//! Incremental indexing of a repository's first-parent history.
//!
//! Every missing commit is applied in its own transaction: a new ancestry
//! node, hop extension of surviving rows, then the symbol delta of the
//! commit's changed paths. A failure rolls back the commit in flight and
//! aborts the run; commits applied before it stay valid.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::cache::{PathSymbolsCache, SymbolIdCache};
use crate::error::IndexError;
use crate::git::{Git, SymbolParser, batch_paths};
use crate::ruler::ruler;
use crate::store::{Lock, Session, Store};
use crate::types::{ChangeStatus, CommitId, HopColumn, LogEntry, RepoId};

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Capacity of the `(path, name) -> row` cache used to resolve deletions.
    pub symbols_cache_size: usize,
    /// Capacity of the `path -> names` cache of the previous tip.
    pub path_symbols_cache_size: usize,
    /// Upper bound on the summed path length of one archive request.
    pub max_total_paths_length: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            symbols_cache_size: 100_000,
            path_symbols_cache_size: 10_000,
            max_total_paths_length: 100_000,
        }
    }
}

/// Observer for a running index operation.
pub trait IndexProgress: Send + Sync {
    fn started(&self, _total: usize) {}
    fn committed(&self, _done: usize, _total: usize) {}
}

impl IndexProgress for () {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Commits written by this run. Zero when the target was already indexed.
    pub indexed: usize,
}

#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn Store>,
    git: Arc<dyn Git>,
    parser: Arc<dyn SymbolParser>,
    config: IndexerConfig,
}

/// Most recently indexed commit of the run.
#[derive(Clone, Debug)]
struct Tip {
    id: CommitId,
    hash: Option<String>,
    height: u32,
}

impl Tip {
    fn root() -> Self {
        Self {
            id: CommitId::ROOT,
            hash: None,
            height: 0,
        }
    }
}

struct RunCaches {
    symbol_ids: SymbolIdCache,
    path_symbols: PathSymbolsCache,
    /// Commit the path-symbols cache describes.
    path_symbols_at: Option<String>,
}

type SymbolSets = HashMap<String, HashSet<String>>;

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        git: Arc<dyn Git>,
        parser: Arc<dyn SymbolParser>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            git,
            parser,
            config,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Bring `repo` up to date with `commit`. Holds the repository's Write
    /// and Indexing locks for the whole run, so readers drain first and a
    /// concurrent run for the same repository finds nothing left to do.
    pub async fn index(
        &self,
        repo: &str,
        commit: &str,
        progress: &dyn IndexProgress,
    ) -> Result<IndexOutcome, IndexError> {
        let mut session = self.store.session().await?;
        session.lock(Lock::Write, repo).await?;
        if let Err(err) = session.lock(Lock::Indexing, repo).await {
            session.unlock(Lock::Write, repo).await?;
            return Err(err.into());
        }
        let result = self.index_locked(session.as_mut(), repo, commit, progress).await;
        let unlocked_indexing = session.unlock(Lock::Indexing, repo).await;
        let unlocked_write = session.unlock(Lock::Write, repo).await;
        let outcome = result?;
        unlocked_indexing?;
        unlocked_write?;
        Ok(outcome)
    }

    async fn index_locked(
        &self,
        session: &mut dyn Session,
        repo: &str,
        commit: &str,
        progress: &dyn IndexProgress,
    ) -> Result<IndexOutcome, IndexError> {
        let started = Instant::now();
        let existing = session.find_repo(repo).await?;

        let mut missing = 0usize;
        let mut tip = Tip::root();
        {
            let mut revs = self.git.rev_list(repo, commit);
            while let Some(hash) = revs.next().await {
                let hash = hash.map_err(IndexError::Git)?;
                if let Some(repo_id) = existing {
                    if let Some(node) = session.get_commit(repo_id, &hash).await? {
                        tip = Tip {
                            id: node.id,
                            hash: Some(node.hash),
                            height: node.height,
                        };
                        break;
                    }
                }
                missing += 1;
            }
        }

        if missing == 0 {
            debug!(repo, commit, "already indexed");
            return Ok(IndexOutcome::default());
        }

        let repo_id = session.touch_repo(repo).await?;
        info!(repo, commit, missing, from = ?tip.hash, "indexing");
        progress.started(missing);

        let mut caches = RunCaches {
            symbol_ids: SymbolIdCache::new(self.config.symbols_cache_size),
            path_symbols: PathSymbolsCache::new(self.config.path_symbols_cache_size),
            path_symbols_at: None,
        };

        let mut indexed = 0usize;
        let mut log = self.git.log_reverse(repo, commit, missing);
        while let Some(entry) = log.next().await {
            let entry = entry.map_err(IndexError::Git)?;

            session.begin().await?;
            match self
                .index_commit(session, repo, repo_id, &entry, &tip, &mut caches)
                .await
            {
                Ok(next) => {
                    session.commit().await?;
                    tip = next;
                }
                Err(err) => {
                    if let Err(rollback) = session.rollback().await {
                        warn!(repo, commit = %entry.commit, error = %rollback, "rollback failed");
                    }
                    warn!(repo, commit = %entry.commit, error = %err, "indexing aborted");
                    return Err(err);
                }
            }

            indexed += 1;
            progress.committed(indexed, missing);
        }

        info!(
            repo,
            commit,
            indexed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "indexing complete"
        );
        Ok(IndexOutcome { indexed })
    }

    async fn index_commit(
        &self,
        session: &mut dyn Session,
        repo: &str,
        repo_id: RepoId,
        entry: &LogEntry,
        tip: &Tip,
        caches: &mut RunCaches,
    ) -> Result<Tip, IndexError> {
        let height = tip
            .height
            .checked_add(1)
            .ok_or_else(|| IndexError::HeightOverflow(entry.commit.clone()))?;
        let hops = session.get_hops(tip.id).await?;
        let r = ruler(height);
        if r >= hops.len() {
            return Err(IndexError::RulerOutOfRange {
                height,
                ruler: r,
                hops: hops.len(),
            });
        }

        let commit = session
            .insert_commit(repo_id, &entry.commit, height, hops[r])
            .await?;
        if r > 0 {
            session
                .append_hop(repo_id, &hops[..r], HopColumn::Added, commit)
                .await?;
            session
                .append_hop(repo_id, &hops[..r], HopColumn::Deleted, commit)
                .await?;
        }

        let mut old_paths = Vec::new();
        let mut new_paths = Vec::new();
        for change in &entry.path_statuses {
            match change.status {
                ChangeStatus::Added => new_paths.push(change.path.clone()),
                ChangeStatus::Modified => {
                    old_paths.push(change.path.clone());
                    new_paths.push(change.path.clone());
                }
                ChangeStatus::Deleted => old_paths.push(change.path.clone()),
            }
        }

        let old = self.old_symbols(repo, tip, old_paths.clone(), caches).await?;
        let new = if new_paths.is_empty() {
            SymbolSets::new()
        } else {
            self.symbols_at(repo, &entry.commit, new_paths.clone()).await?
        };

        let empty = HashSet::new();
        let touched: BTreeSet<&String> = old_paths.iter().chain(new_paths.iter()).collect();
        let mut deletions: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut insertions: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for path in touched {
            let before = old.get(path).unwrap_or(&empty);
            let after = new.get(path).unwrap_or(&empty);
            let mut gone: Vec<&str> = before.difference(after).map(String::as_str).collect();
            let mut added: Vec<&str> = after.difference(before).map(String::as_str).collect();
            gone.sort_unstable();
            added.sort_unstable();
            if !gone.is_empty() {
                deletions.insert(path.as_str(), gone);
            }
            if !added.is_empty() {
                insertions.insert(path.as_str(), added);
            }
        }

        for (path, names) in &deletions {
            for name in names {
                let id = match caches.symbol_ids.get(path, name) {
                    Some(id) => Some(id),
                    None => {
                        let mut found = None;
                        for hop in &hops {
                            found = session.find_symbol(repo_id, path, name, *hop, &hops).await?;
                            if found.is_some() {
                                break;
                            }
                        }
                        found
                    }
                };
                let Some(id) = id else {
                    return Err(IndexError::MissingSymbol {
                        path: path.to_string(),
                        name: name.to_string(),
                        commit: entry.commit.clone(),
                    });
                };
                session.mark_deleted(id, commit).await?;
            }
        }

        for (path, names) in &insertions {
            for name in names {
                let id = session.insert_symbol(repo_id, commit, path, name).await?;
                caches.symbol_ids.set(path, name, id);
            }
        }

        let pruned = session.delete_redundant(repo_id, commit).await?;

        for path in &old_paths {
            if !new.contains_key(path) {
                caches.path_symbols.set(path.clone(), HashSet::new());
            }
        }
        for path in &new_paths {
            let names = new.get(path).cloned().unwrap_or_default();
            caches.path_symbols.set(path.clone(), names);
        }
        caches.path_symbols_at = Some(entry.commit.clone());

        debug!(
            repo,
            commit = %entry.commit,
            height,
            paths = entry.path_statuses.len(),
            deleted = deletions.values().map(Vec::len).sum::<usize>(),
            inserted = insertions.values().map(Vec::len).sum::<usize>(),
            pruned,
            "indexed commit"
        );

        Ok(Tip {
            id: commit,
            hash: Some(entry.commit.clone()),
            height,
        })
    }

    /// Symbol names of `paths` at the previous tip, served from the
    /// path-symbols cache when it describes that commit.
    async fn old_symbols(
        &self,
        repo: &str,
        tip: &Tip,
        paths: Vec<String>,
        caches: &mut RunCaches,
    ) -> Result<SymbolSets, IndexError> {
        let Some(tip_hash) = &tip.hash else {
            return Ok(SymbolSets::new());
        };
        let cache_valid = caches.path_symbols_at.as_deref() == Some(tip_hash.as_str());

        let mut sets = SymbolSets::new();
        let mut uncached = Vec::new();
        for path in paths {
            match cache_valid.then(|| caches.path_symbols.get(&path)).flatten() {
                Some(names) => {
                    sets.insert(path, names);
                }
                None => uncached.push(path),
            }
        }
        if !uncached.is_empty() {
            sets.extend(self.symbols_at(repo, tip_hash, uncached).await?);
        }
        Ok(sets)
    }

    /// Parse `paths` at `commit`. Paths absent at that commit are omitted.
    async fn symbols_at(
        &self,
        repo: &str,
        commit: &str,
        paths: Vec<String>,
    ) -> Result<SymbolSets, IndexError> {
        let mut sets = SymbolSets::new();
        for batch in batch_paths(paths, self.config.max_total_paths_length) {
            let mut files = self.git.archive(repo, commit, batch);
            while let Some(file) = files.next().await {
                let file = file.map_err(IndexError::Git)?;
                let symbols = self
                    .parser
                    .parse(&file.path, &file.content)
                    .await
                    .map_err(|source| IndexError::Parse {
                        path: file.path.clone(),
                        source,
                    })?;
                sets.insert(
                    file.path,
                    symbols.into_iter().map(|symbol| symbol.name).collect(),
                );
            }
        }
        Ok(sets)
    }
}
