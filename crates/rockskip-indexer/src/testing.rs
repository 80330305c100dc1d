//! Scripted collaborators for tests: an in-memory first-parent history and a
//! parser that treats every non-empty line as a symbol definition.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use crate::git::{Git, GitStream, SymbolParser};
use crate::types::{ArchiveFile, ChangeStatus, LogEntry, ParsedSymbol, PathStatus};

#[derive(Clone, Debug)]
struct ScriptedCommit {
    hash: String,
    files: BTreeMap<String, String>,
    changes: Vec<PathStatus>,
}

/// Linear history per repository. Commit hashes are `<repo>@<n>` unless
/// given explicitly.
#[derive(Clone, Default)]
pub struct ScriptedGit {
    repos: Arc<Mutex<HashMap<String, Vec<ScriptedCommit>>>>,
    log_calls: Arc<AtomicUsize>,
    archive_calls: Arc<AtomicUsize>,
}

impl ScriptedGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a commit to `repo`. `Some(content)` writes a file, `None`
    /// deletes it. Returns the new commit hash.
    pub fn commit(&self, repo: &str, edits: &[(&str, Option<&str>)]) -> String {
        let mut repos = self.repos.lock();
        let history = repos.entry(repo.to_string()).or_default();
        let hash = format!("{repo}@{}", history.len() + 1);
        let mut files = history
            .last()
            .map(|commit| commit.files.clone())
            .unwrap_or_default();
        let mut changes = Vec::new();
        for (path, content) in edits {
            let status = match (files.contains_key(*path), content) {
                (false, Some(_)) => ChangeStatus::Added,
                (true, Some(_)) => ChangeStatus::Modified,
                (true, None) => ChangeStatus::Deleted,
                (false, None) => continue,
            };
            match content {
                Some(content) => {
                    files.insert(path.to_string(), content.to_string());
                }
                None => {
                    files.remove(*path);
                }
            }
            changes.push(PathStatus {
                path: path.to_string(),
                status,
            });
        }
        history.push(ScriptedCommit {
            hash: hash.clone(),
            files,
            changes,
        });
        hash
    }

    /// Files present at `commit`.
    pub fn files_at(&self, repo: &str, commit: &str) -> BTreeMap<String, String> {
        let repos = self.repos.lock();
        repos
            .get(repo)
            .and_then(|history| history.iter().find(|c| c.hash == commit))
            .map(|c| c.files.clone())
            .unwrap_or_default()
    }

    /// Number of `log_reverse` enumerations started.
    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn archive_calls(&self) -> usize {
        self.archive_calls.load(Ordering::SeqCst)
    }

    fn history_to(&self, repo: &str, commit: &str) -> Result<Vec<ScriptedCommit>> {
        let repos = self.repos.lock();
        let history = repos
            .get(repo)
            .ok_or_else(|| anyhow!("unknown repository {repo}"))?;
        let position = history
            .iter()
            .position(|c| c.hash == commit)
            .ok_or_else(|| anyhow!("unknown revision {commit}"))?;
        Ok(history[..=position].to_vec())
    }
}

impl Git for ScriptedGit {
    fn rev_list(&self, repo: &str, commit: &str) -> GitStream<String> {
        match self.history_to(repo, commit) {
            Ok(history) => Box::pin(stream::iter(
                history.into_iter().rev().map(|c| Ok(c.hash)),
            )),
            Err(err) => Box::pin(stream::iter([Err(err)])),
        }
    }

    fn log_reverse(&self, repo: &str, commit: &str, n: usize) -> GitStream<LogEntry> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        match self.history_to(repo, commit) {
            Ok(history) => {
                let skip = history.len().saturating_sub(n);
                Box::pin(stream::iter(history.into_iter().skip(skip).map(|c| {
                    Ok(LogEntry {
                        commit: c.hash,
                        path_statuses: c.changes,
                    })
                })))
            }
            Err(err) => Box::pin(stream::iter([Err(err)])),
        }
    }

    fn archive(&self, repo: &str, commit: &str, paths: Vec<String>) -> GitStream<ArchiveFile> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        let files = self.files_at(repo, commit);
        let found: Vec<Result<ArchiveFile>> = paths
            .into_iter()
            .filter_map(|path| {
                files.get(&path).map(|content| {
                    Ok(ArchiveFile {
                        path,
                        content: content.clone().into_bytes(),
                    })
                })
            })
            .collect();
        Box::pin(stream::iter(found))
    }
}

/// Every non-empty line is a symbol named after its trimmed text. A line
/// starting with `!` makes the whole file fail to parse.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineParser;

#[async_trait]
impl SymbolParser for LineParser {
    async fn parse(&self, path: &str, content: &[u8]) -> Result<Vec<ParsedSymbol>> {
        let text = std::str::from_utf8(content)?;
        let mut symbols = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            if name.starts_with('!') {
                bail!("{path}:{}: unparseable line", index + 1);
            }
            symbols.push(ParsedSymbol {
                name: name.to_string(),
                kind: "function".to_string(),
                line: index + 1,
                language: "Text".to_string(),
                ..ParsedSymbol::default()
            });
        }
        Ok(symbols)
    }
}
