//! Registry of in-flight operations, rendered by `GET /status`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rockskip_indexer::{IndexProgress, StoreStats};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Search,
    Index,
    Evict,
}

struct Entry {
    kind: OperationKind,
    repo: String,
    commit: Option<String>,
    phase: String,
    started: Instant,
    started_unix_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct OperationView {
    pub id: u64,
    pub kind: OperationKind,
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub phase: String,
    pub started_unix_ms: u64,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub operations: Vec<OperationView>,
    pub totals: StoreStats,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
}

#[derive(Clone, Default)]
pub struct Status {
    registry: Arc<Mutex<Registry>>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. It stays listed until the guard is dropped.
    pub fn begin(&self, kind: OperationKind, repo: &str, commit: Option<&str>) -> OperationGuard {
        let started_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.insert(
            id,
            Entry {
                kind,
                repo: repo.to_string(),
                commit: commit.map(str::to_string),
                phase: "starting".to_string(),
                started: Instant::now(),
                started_unix_ms,
            },
        );
        OperationGuard {
            id,
            registry: self.registry.clone(),
        }
    }

    pub fn snapshot(&self) -> Vec<OperationView> {
        let registry = self.registry.lock();
        registry
            .entries
            .iter()
            .map(|(id, entry)| OperationView {
                id: *id,
                kind: entry.kind,
                repo: entry.repo.clone(),
                commit: entry.commit.clone(),
                phase: entry.phase.clone(),
                started_unix_ms: entry.started_unix_ms,
                elapsed_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect()
    }
}

pub struct OperationGuard {
    id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl OperationGuard {
    pub fn set_phase(&self, phase: impl Into<String>) {
        if let Some(entry) = self.registry.lock().entries.get_mut(&self.id) {
            entry.phase = phase.into();
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.lock().entries.remove(&self.id);
    }
}

impl IndexProgress for OperationGuard {
    fn started(&self, total: usize) {
        self.set_phase(format!("indexing 0/{total}"));
    }

    fn committed(&self, done: usize, total: usize) {
        self.set_phase(format!("indexing {done}/{total}"));
    }
}
