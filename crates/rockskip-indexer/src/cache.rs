use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::SymbolId;

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// `(path, name) -> row id` for symbols seen during one indexing run.
pub struct SymbolIdCache {
    entries: LruCache<(String, String), SymbolId>,
}

impl SymbolIdCache {
    pub fn new(size: usize) -> Self {
        Self {
            entries: LruCache::new(capacity(size)),
        }
    }

    pub fn get(&mut self, path: &str, name: &str) -> Option<SymbolId> {
        self.entries
            .get(&(path.to_string(), name.to_string()))
            .copied()
    }

    pub fn set(&mut self, path: &str, name: &str, id: SymbolId) {
        self.entries.put((path.to_string(), name.to_string()), id);
    }
}

/// `path -> symbol names` as of the most recently indexed commit.
pub struct PathSymbolsCache {
    entries: LruCache<String, HashSet<String>>,
}

impl PathSymbolsCache {
    pub fn new(size: usize) -> Self {
        Self {
            entries: LruCache::new(capacity(size)),
        }
    }

    pub fn get(&mut self, path: &str) -> Option<HashSet<String>> {
        self.entries.get(path).cloned()
    }

    pub fn set(&mut self, path: String, symbols: HashSet<String>) {
        self.entries.put(path, symbols);
    }
}
