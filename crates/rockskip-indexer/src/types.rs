use std::fmt;

use serde::{Deserialize, Serialize};

/// Primary key of a node in the ancestry chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(pub i32);

impl CommitId {
    /// Synthetic root every chain terminates at (height 0).
    pub const ROOT: CommitId = CommitId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub i32);

/// An indexed commit as stored in the ancestry table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitNode {
    pub id: CommitId,
    pub hash: String,
    pub height: u32,
}

/// Which hop array of a symbol row an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopColumn {
    Added,
    Deleted,
}

impl HopColumn {
    pub fn column(self) -> &'static str {
        match self {
            HopColumn::Added => "added",
            HopColumn::Deleted => "deleted",
        }
    }
}

/// Diff status of one path in a commit, reduced to added/modified/deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathStatus {
    pub path: String,
    pub status: ChangeStatus,
}

/// One commit of `git log --reverse` with its first-parent changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub commit: String,
    pub path_statuses: Vec<PathStatus>,
}

/// Raw file contents fetched at a commit.
#[derive(Clone, Debug)]
pub struct ArchiveFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// A symbol definition reported by a parser. `line` is 1-based.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSymbol {
    pub name: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub kind: String,
    pub line: usize,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub parent_kind: String,
}

/// Resident totals reported on the status page.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub repos: i64,
    pub commits: i64,
    pub symbols: i64,
}
