//! Query execution at an indexed commit: the store narrows the candidate
//! paths, then candidates are fetched and re-parsed so positions come from
//! the file contents rather than from the index.

use std::time::Duration;

use futures::StreamExt;
use rockskip_indexer::{
    CommitNode, CompiledQuery, Git, RepoId, Session, SymbolParser, SymbolQuery, batch_paths,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SearchError;
use crate::telemetry;

pub const DEFAULT_LIMIT: usize = 100;

/// One search request, as accepted by every entry point.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SearchParams {
    pub repo: String,
    pub commit: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub is_regexp: bool,
    #[serde(default)]
    pub is_case_sensitive: bool,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_pattern: String,
    /// Maximum number of symbols; zero or absent selects the default.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default, with = "optional_secs")]
    pub timeout: Option<Duration>,
}

impl SearchParams {
    pub fn limit(&self) -> usize {
        match self.limit {
            Some(limit) if limit > 0 => limit,
            _ => DEFAULT_LIMIT,
        }
    }

    /// Plan and compile the name/path predicates, rejecting bad patterns
    /// before any lock is taken.
    pub fn plan(&self) -> Result<PlannedQuery, SearchError> {
        let query = SymbolQuery::plan(
            &self.query,
            self.is_regexp,
            self.is_case_sensitive,
            &self.include_patterns,
            &self.exclude_pattern,
        );
        let compiled = query.compile()?;
        Ok(PlannedQuery {
            query,
            compiled,
            limit: self.limit(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct PlannedQuery {
    /// Predicates pushed down to the store.
    pub query: SymbolQuery,
    /// The same predicates, applied to freshly parsed symbols.
    pub compiled: CompiledQuery,
    pub limit: usize,
}

/// A symbol definition found by a search. `line` is 1-based; `character`
/// is the byte offset of the name within that line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMatch {
    pub name: String,
    pub path: String,
    pub line: usize,
    pub character: usize,
    pub kind: String,
    pub parent: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub parent_kind: String,
}

/// Search-time collaborators and settings.
pub struct QueryContext<'a> {
    pub git: &'a dyn Git,
    pub parser: &'a dyn SymbolParser,
    pub max_total_paths_length: usize,
}

/// Run a planned query at `commit`. The caller holds the Read lock.
pub async fn execute(
    session: &mut dyn Session,
    ctx: &QueryContext<'_>,
    repo: &str,
    repo_id: RepoId,
    commit: &CommitNode,
    planned: &PlannedQuery,
) -> Result<Vec<SymbolMatch>, SearchError> {
    let limit = planned.limit;
    let started = std::time::Instant::now();
    let mut hops = session.get_hops(commit.id).await?;
    hops.retain(|hop| !hop.is_root());
    let paths = session.search_paths(repo_id, &hops, &planned.query, limit).await?;
    telemetry::record_stage_latency("query", started.elapsed().as_millis() as u64);
    debug!(repo, commit = %commit.hash, candidates = paths.len(), "candidate paths");

    let started = std::time::Instant::now();
    let mut matches = Vec::new();
    'batches: for batch in batch_paths(paths, ctx.max_total_paths_length) {
        let mut files = ctx.git.archive(repo, &commit.hash, batch);
        while let Some(file) = files.next().await {
            let file = file.map_err(SearchError::Internal)?;
            let symbols = match ctx.parser.parse(&file.path, &file.content).await {
                Ok(symbols) => symbols,
                Err(err) => {
                    warn!(repo, path = %file.path, error = %err, "failed to parse candidate, skipping");
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&file.content);
            let lines: Vec<&str> = text.lines().collect();

            for symbol in symbols {
                if !planned.compiled.matches_name(&symbol.name) {
                    continue;
                }
                let Some(line) = symbol.line.checked_sub(1).and_then(|index| lines.get(index)) else {
                    warn!(
                        repo,
                        path = %file.path,
                        name = %symbol.name,
                        line = symbol.line,
                        lines = lines.len(),
                        "symbol line out of range, skipping"
                    );
                    continue;
                };
                matches.push(SymbolMatch {
                    character: line.find(symbol.name.as_str()).unwrap_or(0),
                    name: symbol.name,
                    path: file.path.clone(),
                    line: symbol.line,
                    kind: symbol.kind,
                    parent: symbol.parent,
                    language: symbol.language,
                    parent_kind: symbol.parent_kind,
                });
                if matches.len() >= limit {
                    break 'batches;
                }
            }
        }
    }
    telemetry::record_stage_latency("parse", started.elapsed().as_millis() as u64);
    Ok(matches)
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64))
    }
}
