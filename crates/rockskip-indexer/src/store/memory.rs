//! In-process store with the same observable semantics as the PostgreSQL
//! backend: session-scoped stacking locks, and transactions that are atomic
//! and invisible to other sessions until committed.
//!
//! Transactions hold the data mutex for their whole duration, which
//! serialises writers; autocommit operations take it briefly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use super::{Lock, Session, Store, repo_key};
use crate::error::{StoreError, StoreResult};
use crate::query::SymbolQuery;
use crate::types::{CommitId, CommitNode, HopColumn, RepoId, StoreStats, SymbolId};

type LockKey = (i32, i32);
type Undo = Box<dyn FnOnce(&mut Data) + Send>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of open sessions the way a connection pool does:
    /// `session()` waits up to `acquire_timeout` for one to close.
    pub fn with_session_limit(max_sessions: usize, acquire_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                limit: Some(SessionLimit {
                    permits: Arc::new(Semaphore::new(max_sessions.max(1))),
                    acquire_timeout,
                }),
                ..Shared::default()
            }),
        }
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }
}

struct SessionLimit {
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

#[derive(Default)]
struct Shared {
    data: Arc<AsyncMutex<Data>>,
    locks: Mutex<LockTable>,
    released: Notify,
    next_session: AtomicU64,
    open_sessions: AtomicUsize,
    limit: Option<SessionLimit>,
}

#[async_trait]
impl Store for MemoryStore {
    async fn session(&self) -> StoreResult<Box<dyn Session>> {
        let permit = match &self.shared.limit {
            Some(limit) => Some(
                tokio::time::timeout(limit.acquire_timeout, limit.permits.clone().acquire_owned())
                    .await
                    .map_err(|_| StoreError::SessionTimeout(limit.acquire_timeout))?
                    .map_err(|_| StoreError::Closed)?,
            ),
            None => None,
        };
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            id,
            shared: self.shared.clone(),
            tx: None,
            held: Vec::new(),
            _permit: permit,
        }))
    }
}

#[derive(Clone)]
struct RepoRow {
    id: RepoId,
    last_accessed: u64,
}

#[derive(Clone)]
struct CommitRow {
    repo_id: RepoId,
    hash: String,
    height: u32,
    ancestor: CommitId,
}

#[derive(Clone)]
struct SymbolRow {
    repo_id: RepoId,
    path: String,
    name: String,
    added: Vec<CommitId>,
    deleted: Vec<CommitId>,
}

impl SymbolRow {
    fn column_mut(&mut self, column: HopColumn) -> &mut Vec<CommitId> {
        match column {
            HopColumn::Added => &mut self.added,
            HopColumn::Deleted => &mut self.deleted,
        }
    }

    fn column(&self, column: HopColumn) -> &[CommitId] {
        match column {
            HopColumn::Added => &self.added,
            HopColumn::Deleted => &self.deleted,
        }
    }

    fn visible_at(&self, hops: &[CommitId]) -> bool {
        intersects(&self.added, hops) && !intersects(&self.deleted, hops)
    }
}

fn intersects(values: &[CommitId], hops: &[CommitId]) -> bool {
    values.iter().any(|value| hops.contains(value))
}

#[derive(Default)]
struct Data {
    clock: u64,
    repos: HashMap<String, RepoRow>,
    last_repo_id: i32,
    commits: HashMap<CommitId, CommitRow>,
    commit_ids: HashMap<(RepoId, String), CommitId>,
    last_commit_id: i32,
    symbols: BTreeMap<i32, SymbolRow>,
    last_symbol_id: i32,
}

impl Data {
    fn rank(&self, last_accessed: u64) -> usize {
        1 + self
            .repos
            .values()
            .filter(|row| row.last_accessed > last_accessed)
            .count()
    }
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<LockKey, LockEntry>,
}

#[derive(Default)]
struct LockEntry {
    shared: HashMap<u64, usize>,
    exclusive: HashMap<u64, usize>,
}

impl LockEntry {
    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_empty()
    }
}

impl LockTable {
    fn try_acquire(&mut self, session: u64, key: LockKey, shared: bool) -> bool {
        let entry = self.entries.entry(key).or_default();
        let other_exclusive = entry.exclusive.keys().any(|holder| *holder != session);
        let other_shared = entry.shared.keys().any(|holder| *holder != session);
        let granted = !other_exclusive && (shared || !other_shared);
        if granted {
            let holders = if shared {
                &mut entry.shared
            } else {
                &mut entry.exclusive
            };
            *holders.entry(session).or_insert(0) += 1;
        } else if entry.is_empty() {
            self.entries.remove(&key);
        }
        granted
    }

    fn release(&mut self, session: u64, key: LockKey, shared: bool) -> bool {
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        let holders = if shared {
            &mut entry.shared
        } else {
            &mut entry.exclusive
        };
        let Some(count) = holders.get_mut(&session) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            holders.remove(&session);
        }
        if entry.is_empty() {
            self.entries.remove(&key);
        }
        true
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Data>,
    undo: Vec<Undo>,
}

impl MemoryTx {
    fn roll_back(mut self) {
        while let Some(undo) = self.undo.pop() {
            undo(&mut self.guard);
        }
    }
}

pub struct MemorySession {
    id: u64,
    shared: Arc<Shared>,
    tx: Option<MemoryTx>,
    held: Vec<(LockKey, bool)>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MemorySession {
    async fn with_data<R>(&mut self, f: impl FnOnce(&mut Data, &mut Vec<Undo>) -> R + Send) -> R {
        match &mut self.tx {
            Some(tx) => f(&mut *tx.guard, &mut tx.undo),
            None => {
                let mut guard = self.shared.data.lock().await;
                let mut undo = Vec::new();
                f(&mut *guard, &mut undo)
            }
        }
    }

    fn try_acquire(&mut self, lock: Lock, repo: &str) -> bool {
        let key = (lock.namespace(), repo_key(repo));
        let granted = self
            .shared
            .locks
            .lock()
            .try_acquire(self.id, key, lock.shared());
        if granted {
            self.held.push((key, lock.shared()));
        }
        granted
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        if let Some(tx) = self.tx.take() {
            tx.roll_back();
        }
        if !self.held.is_empty() {
            let mut locks = self.shared.locks.lock();
            for (key, shared) in self.held.drain(..) {
                locks.release(self.id, key, shared);
            }
            drop(locks);
            self.shared.released.notify_waiters();
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn try_lock(&mut self, lock: Lock, repo: &str) -> StoreResult<bool> {
        Ok(self.try_acquire(lock, repo))
    }

    async fn lock(&mut self, lock: Lock, repo: &str) -> StoreResult<()> {
        let shared = self.shared.clone();
        loop {
            let released = shared.released.notified();
            if self.try_acquire(lock, repo) {
                return Ok(());
            }
            released.await;
        }
    }

    async fn unlock(&mut self, lock: Lock, repo: &str) -> StoreResult<()> {
        let key = (lock.namespace(), repo_key(repo));
        let position = self
            .held
            .iter()
            .rposition(|held| *held == (key, lock.shared()))
            .ok_or_else(|| StoreError::LockNotHeld(format!("{lock} lock on {repo}")))?;
        self.held.remove(position);
        self.shared
            .locks
            .lock()
            .release(self.id, key, lock.shared());
        self.shared.released.notify_waiters();
        Ok(())
    }

    async fn begin(&mut self) -> StoreResult<()> {
        if self.tx.is_some() {
            return Err(StoreError::NestedTransaction);
        }
        let guard = self.shared.data.clone().lock_owned().await;
        self.tx = Some(MemoryTx {
            guard,
            undo: Vec::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.tx.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::NoTransaction)?;
        tx.roll_back();
        Ok(())
    }

    async fn touch_repo(&mut self, repo: &str) -> StoreResult<RepoId> {
        let repo = repo.to_string();
        Ok(self
            .with_data(move |data, undo| {
                data.clock += 1;
                let now = data.clock;
                if let Some(row) = data.repos.get_mut(&repo) {
                    let previous = row.last_accessed;
                    row.last_accessed = now;
                    let id = row.id;
                    undo.push(Box::new(move |data: &mut Data| {
                        if let Some(row) = data.repos.get_mut(&repo) {
                            row.last_accessed = previous;
                        }
                    }));
                    return id;
                }
                data.last_repo_id += 1;
                let id = RepoId(data.last_repo_id);
                data.repos.insert(
                    repo.clone(),
                    RepoRow {
                        id,
                        last_accessed: now,
                    },
                );
                undo.push(Box::new(move |data: &mut Data| {
                    data.repos.remove(&repo);
                }));
                id
            })
            .await)
    }

    async fn find_repo(&mut self, repo: &str) -> StoreResult<Option<RepoId>> {
        Ok(self
            .with_data(|data, _| data.repos.get(repo).map(|row| row.id))
            .await)
    }

    async fn get_commit(&mut self, repo_id: RepoId, hash: &str) -> StoreResult<Option<CommitNode>> {
        Ok(self
            .with_data(|data, _| {
                let id = *data.commit_ids.get(&(repo_id, hash.to_string()))?;
                let row = data.commits.get(&id)?;
                Some(CommitNode {
                    id,
                    hash: row.hash.clone(),
                    height: row.height,
                })
            })
            .await)
    }

    async fn insert_commit(
        &mut self,
        repo_id: RepoId,
        hash: &str,
        height: u32,
        ancestor: CommitId,
    ) -> StoreResult<CommitId> {
        let hash = hash.to_string();
        self.with_data(move |data, undo| {
            let key = (repo_id, hash.clone());
            if data.commit_ids.contains_key(&key) {
                return Err(StoreError::DuplicateCommit(hash));
            }
            data.last_commit_id += 1;
            let id = CommitId(data.last_commit_id);
            data.commits.insert(
                id,
                CommitRow {
                    repo_id,
                    hash,
                    height,
                    ancestor,
                },
            );
            data.commit_ids.insert(key.clone(), id);
            undo.push(Box::new(move |data: &mut Data| {
                data.commits.remove(&id);
                data.commit_ids.remove(&key);
            }));
            Ok(id)
        })
        .await
    }

    async fn get_hops(&mut self, commit: CommitId) -> StoreResult<Vec<CommitId>> {
        self.with_data(|data, _| {
            let mut hops = vec![commit];
            let mut current = commit;
            while !current.is_root() {
                let row = data
                    .commits
                    .get(&current)
                    .ok_or(StoreError::UnknownCommit(current))?;
                current = row.ancestor;
                hops.push(current);
            }
            Ok(hops)
        })
        .await
    }

    async fn append_hop(
        &mut self,
        repo_id: RepoId,
        hops: &[CommitId],
        column: HopColumn,
        commit: CommitId,
    ) -> StoreResult<u64> {
        if hops.is_empty() {
            return Ok(0);
        }
        Ok(self
            .with_data(|data, undo| {
                let mut touched = Vec::new();
                for (id, row) in data.symbols.iter_mut() {
                    if row.repo_id == repo_id && intersects(row.column(column), hops) {
                        row.column_mut(column).push(commit);
                        touched.push(*id);
                    }
                }
                let count = touched.len() as u64;
                undo.push(Box::new(move |data: &mut Data| {
                    for id in touched {
                        if let Some(row) = data.symbols.get_mut(&id) {
                            row.column_mut(column).pop();
                        }
                    }
                }));
                count
            })
            .await)
    }

    async fn find_symbol(
        &mut self,
        repo_id: RepoId,
        path: &str,
        name: &str,
        hop: CommitId,
        visible_at: &[CommitId],
    ) -> StoreResult<Option<SymbolId>> {
        Ok(self
            .with_data(|data, _| {
                data.symbols
                    .iter()
                    .find(|(_, row)| {
                        row.repo_id == repo_id
                            && row.path == path
                            && row.name == name
                            && row.added.contains(&hop)
                            && !intersects(&row.deleted, visible_at)
                    })
                    .map(|(id, _)| SymbolId(*id))
            })
            .await)
    }

    async fn insert_symbol(
        &mut self,
        repo_id: RepoId,
        commit: CommitId,
        path: &str,
        name: &str,
    ) -> StoreResult<SymbolId> {
        let row = SymbolRow {
            repo_id,
            path: path.to_string(),
            name: name.to_string(),
            added: vec![commit],
            deleted: Vec::new(),
        };
        Ok(self
            .with_data(move |data, undo| {
                data.last_symbol_id += 1;
                let id = data.last_symbol_id;
                data.symbols.insert(id, row);
                undo.push(Box::new(move |data: &mut Data| {
                    data.symbols.remove(&id);
                }));
                SymbolId(id)
            })
            .await)
    }

    async fn mark_deleted(&mut self, symbol: SymbolId, commit: CommitId) -> StoreResult<()> {
        self.with_data(move |data, undo| {
            if let Some(row) = data.symbols.get_mut(&symbol.0) {
                row.deleted.push(commit);
                undo.push(Box::new(move |data: &mut Data| {
                    if let Some(row) = data.symbols.get_mut(&symbol.0) {
                        row.deleted.pop();
                    }
                }));
            }
        })
        .await;
        Ok(())
    }

    async fn delete_redundant(&mut self, repo_id: RepoId, commit: CommitId) -> StoreResult<u64> {
        Ok(self
            .with_data(move |data, undo| {
                let mut previous = Vec::new();
                for (id, row) in data.symbols.iter_mut() {
                    if row.repo_id == repo_id
                        && row.added.contains(&commit)
                        && row.deleted.contains(&commit)
                    {
                        previous.push((*id, row.added.clone(), row.deleted.clone()));
                        row.added.retain(|hop| *hop != commit);
                        row.deleted.retain(|hop| *hop != commit);
                    }
                }
                let count = previous.len() as u64;
                undo.push(Box::new(move |data: &mut Data| {
                    for (id, added, deleted) in previous {
                        if let Some(row) = data.symbols.get_mut(&id) {
                            row.added = added;
                            row.deleted = deleted;
                        }
                    }
                }));
                count
            })
            .await)
    }

    async fn search_paths(
        &mut self,
        repo_id: RepoId,
        hops: &[CommitId],
        query: &SymbolQuery,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let compiled = query.compile()?;
        Ok(self
            .with_data(|data, _| {
                let paths: BTreeSet<&str> = data
                    .symbols
                    .values()
                    .filter(|row| {
                        row.repo_id == repo_id
                            && row.visible_at(hops)
                            && compiled.matches_name(&row.name)
                            && compiled.matches_path(&row.path)
                    })
                    .map(|row| row.path.as_str())
                    .collect();
                paths
                    .into_iter()
                    .take(limit)
                    .map(str::to_string)
                    .collect()
            })
            .await)
    }

    async fn evictable_repo(&mut self, max_repos: usize) -> StoreResult<Option<String>> {
        Ok(self
            .with_data(|data, _| {
                data.repos
                    .iter()
                    .filter(|(_, row)| data.rank(row.last_accessed) > max_repos)
                    .min_by_key(|(_, row)| row.last_accessed)
                    .map(|(name, _)| name.clone())
            })
            .await)
    }

    async fn repo_rank(&mut self, repo: &str) -> StoreResult<Option<usize>> {
        Ok(self
            .with_data(|data, _| {
                data.repos
                    .get(repo)
                    .map(|row| data.rank(row.last_accessed))
            })
            .await)
    }

    async fn delete_repo(&mut self, repo: &str) -> StoreResult<()> {
        let repo = repo.to_string();
        self.with_data(move |data, undo| {
            let Some(row) = data.repos.remove(&repo) else {
                return;
            };
            let repo_id = row.id;
            let commits: Vec<(CommitId, CommitRow)> = data
                .commits
                .iter()
                .filter(|(_, commit)| commit.repo_id == repo_id)
                .map(|(id, commit)| (*id, commit.clone()))
                .collect();
            for (id, commit) in &commits {
                data.commits.remove(id);
                data.commit_ids.remove(&(repo_id, commit.hash.clone()));
            }
            let symbols: Vec<(i32, SymbolRow)> = data
                .symbols
                .iter()
                .filter(|(_, symbol)| symbol.repo_id == repo_id)
                .map(|(id, symbol)| (*id, symbol.clone()))
                .collect();
            for (id, _) in &symbols {
                data.symbols.remove(id);
            }
            undo.push(Box::new(move |data: &mut Data| {
                data.repos.insert(repo, row);
                for (id, commit) in commits {
                    data.commit_ids.insert((repo_id, commit.hash.clone()), id);
                    data.commits.insert(id, commit);
                }
                data.symbols.extend(symbols);
            }));
        })
        .await;
        Ok(())
    }

    async fn stats(&mut self) -> StoreResult<StoreStats> {
        Ok(self
            .with_data(|data, _| StoreStats {
                repos: data.repos.len() as i64,
                commits: data.commits.len() as i64,
                symbols: data.symbols.len() as i64,
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn read_locks_share_and_exclude_writers() {
        let store = MemoryStore::new();
        let mut reader_a = store.session().await.unwrap();
        let mut reader_b = store.session().await.unwrap();
        let mut writer = store.session().await.unwrap();

        assert!(reader_a.try_lock(Lock::Read, "repo").await.unwrap());
        assert!(reader_b.try_lock(Lock::Read, "repo").await.unwrap());
        assert!(!writer.try_lock(Lock::Write, "repo").await.unwrap());
        assert!(writer.try_lock(Lock::Indexing, "repo").await.unwrap());
        assert!(writer.try_lock(Lock::Write, "other").await.unwrap());

        reader_a.unlock(Lock::Read, "repo").await.unwrap();
        reader_b.unlock(Lock::Read, "repo").await.unwrap();
        assert!(writer.try_lock(Lock::Write, "repo").await.unwrap());
        assert!(!reader_a.try_lock(Lock::Read, "repo").await.unwrap());
        // The holder of the write lock may stack a read lock on top.
        assert!(writer.try_lock(Lock::Read, "repo").await.unwrap());
    }

    #[tokio::test]
    async fn session_limit_waits_then_times_out() {
        let store = MemoryStore::with_session_limit(1, Duration::from_millis(50));
        let first = store.session().await.unwrap();
        assert_eq!(store.open_sessions(), 1);
        assert!(matches!(
            store.session().await.err(),
            Some(StoreError::SessionTimeout(_))
        ));

        drop(first);
        assert_eq!(store.open_sessions(), 0);
        let _second = store.session().await.unwrap();
        assert_eq!(store.open_sessions(), 1);
    }

    #[tokio::test]
    async fn blocking_lock_waits_for_release() {
        let store = MemoryStore::new();
        let mut holder = store.session().await.unwrap();
        holder.lock(Lock::Write, "repo").await.unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut session = waiter_store.session().await.unwrap();
            session.lock(Lock::Write, "repo").await.unwrap();
            session.unlock(Lock::Write, "repo").await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        holder.unlock(Lock::Write, "repo").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should acquire the lock")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_session_releases_locks() {
        let store = MemoryStore::new();
        {
            let mut session = store.session().await.unwrap();
            session.lock(Lock::Indexing, "repo").await.unwrap();
        }
        let mut other = store.session().await.unwrap();
        assert!(other.try_lock(Lock::Indexing, "repo").await.unwrap());
    }

    #[tokio::test]
    async fn unlocking_an_unheld_lock_fails() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        assert!(matches!(
            session.unlock(Lock::Read, "repo").await,
            Err(StoreError::LockNotHeld(_))
        ));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let repo_id = session.touch_repo("repo").await.unwrap();

        session.begin().await.unwrap();
        let commit = session
            .insert_commit(repo_id, "c1", 1, CommitId::ROOT)
            .await
            .unwrap();
        session
            .insert_symbol(repo_id, commit, "a.txt", "sym")
            .await
            .unwrap();
        session.rollback().await.unwrap();

        assert_eq!(session.get_commit(repo_id, "c1").await.unwrap(), None);
        let stats = session.stats().await.unwrap();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.symbols, 0);
        assert_eq!(stats.repos, 1);
    }

    #[tokio::test]
    async fn hops_walk_ancestors_to_root() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let repo_id = session.touch_repo("repo").await.unwrap();
        let c1 = session
            .insert_commit(repo_id, "c1", 1, CommitId::ROOT)
            .await
            .unwrap();
        let c2 = session
            .insert_commit(repo_id, "c2", 2, CommitId::ROOT)
            .await
            .unwrap();
        let c3 = session.insert_commit(repo_id, "c3", 3, c2).await.unwrap();

        assert_eq!(session.get_hops(CommitId::ROOT).await.unwrap(), vec![CommitId::ROOT]);
        assert_eq!(session.get_hops(c1).await.unwrap(), vec![c1, CommitId::ROOT]);
        assert_eq!(
            session.get_hops(c3).await.unwrap(),
            vec![c3, c2, CommitId::ROOT]
        );
        assert!(matches!(
            session.insert_commit(repo_id, "c3", 4, CommitId::ROOT).await,
            Err(StoreError::DuplicateCommit(_))
        ));
    }

    #[tokio::test]
    async fn delete_redundant_prunes_shared_hops() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let repo_id = session.touch_repo("repo").await.unwrap();
        let c1 = CommitId(1);
        let c2 = CommitId(2);
        let id = session
            .insert_symbol(repo_id, c1, "a.txt", "sym")
            .await
            .unwrap();
        session.mark_deleted(id, c1).await.unwrap();
        session
            .append_hop(repo_id, &[c1], HopColumn::Added, c2)
            .await
            .unwrap();
        session
            .append_hop(repo_id, &[c1], HopColumn::Deleted, c2)
            .await
            .unwrap();

        assert_eq!(session.delete_redundant(repo_id, c2).await.unwrap(), 1);
        assert_eq!(
            session
                .find_symbol(repo_id, "a.txt", "sym", c2, &[c2])
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            session
                .find_symbol(repo_id, "a.txt", "sym", c1, &[])
                .await
                .unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn eviction_ranks_follow_access_order() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        for repo in ["a", "b", "c"] {
            session.touch_repo(repo).await.unwrap();
        }
        session.touch_repo("a").await.unwrap();

        assert_eq!(session.repo_rank("a").await.unwrap(), Some(1));
        assert_eq!(session.repo_rank("b").await.unwrap(), Some(3));
        assert_eq!(session.evictable_repo(2).await.unwrap(), Some("b".to_string()));
        assert_eq!(session.evictable_repo(3).await.unwrap(), None);

        session.delete_repo("b").await.unwrap();
        assert_eq!(session.repo_rank("b").await.unwrap(), None);
        assert_eq!(session.evictable_repo(2).await.unwrap(), None);
    }
}
