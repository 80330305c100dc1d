//! Versioned symbol index over first-parent git history.
//!
//! Each symbol row records the hops at which it became visible (`added`)
//! and invisible (`deleted`). A commit's hop chain is an O(log height)
//! walk of ancestor pointers chosen by [`ruler`], so a query at any indexed
//! commit only has to intersect a row's arrays with that chain.

pub mod cache;
pub mod error;
pub mod git;
pub mod indexer;
pub mod query;
pub mod regex_dialect;
pub mod ruler;
pub mod store;
/// Scripted `Git` and `SymbolParser` doubles for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use error::{IndexError, StoreError, StoreResult};
pub use git::{Git, GitStream, SymbolParser, batch_paths};
pub use indexer::{IndexOutcome, IndexProgress, Indexer, IndexerConfig};
pub use query::{CompiledQuery, Condition, Field, Matcher, SymbolQuery};
pub use ruler::ruler;
pub use store::{Lock, MemoryStore, PostgresStore, Session, Store};
pub use types::{
    ArchiveFile, ChangeStatus, CommitId, CommitNode, LogEntry, ParsedSymbol, PathStatus, RepoId,
    StoreStats, SymbolId,
};
