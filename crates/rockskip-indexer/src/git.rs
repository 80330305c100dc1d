use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::{ArchiveFile, LogEntry, ParsedSymbol};

/// Stream of items produced by a VCS operation. Dropping the stream stops
/// the underlying enumeration.
pub type GitStream<T> = BoxStream<'static, Result<T>>;

/// Version-control collaborator used by the indexer and the search path.
pub trait Git: Send + Sync + 'static {
    /// First-parent ancestors of `commit`, newest first, starting with
    /// `commit` itself.
    fn rev_list(&self, repo: &str, commit: &str) -> GitStream<String>;

    /// The `n` most recent first-parent commits up to and including
    /// `commit`, oldest first, each with its changed paths.
    fn log_reverse(&self, repo: &str, commit: &str, n: usize) -> GitStream<LogEntry>;

    /// Contents of `paths` at `commit`. Paths that do not exist or are not
    /// regular files are skipped.
    fn archive(&self, repo: &str, commit: &str, paths: Vec<String>) -> GitStream<ArchiveFile>;
}

/// Symbol extraction collaborator.
#[async_trait]
pub trait SymbolParser: Send + Sync + 'static {
    async fn parse(&self, path: &str, content: &[u8]) -> Result<Vec<ParsedSymbol>>;
}

/// Split `paths` into batches whose summed length stays within
/// `max_total_length`. A single path longer than the bound gets its own batch.
pub fn batch_paths(paths: Vec<String>, max_total_length: usize) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_length = 0usize;

    for path in paths {
        if !current.is_empty() && current_length + path.len() > max_total_length {
            batches.push(std::mem::take(&mut current));
            current_length = 0;
        }
        current_length += path.len();
        current.push(path);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn batches_respect_total_length() {
        let batches = batch_paths(owned(&["aaaa", "bbb", "cc", "d", "eeeee"]), 7);
        assert_eq!(
            batches,
            vec![owned(&["aaaa", "bbb"]), owned(&["cc", "d"]), owned(&["eeeee"])]
        );
    }

    #[test]
    fn oversized_path_is_isolated() {
        let batches = batch_paths(owned(&["a", "very/long/path.rs", "b"]), 4);
        assert_eq!(
            batches,
            vec![owned(&["a"]), owned(&["very/long/path.rs"]), owned(&["b"])]
        );
    }

    #[test]
    fn empty_input_has_no_batches() {
        assert!(batch_paths(Vec::new(), 10).is_empty());
    }
}
