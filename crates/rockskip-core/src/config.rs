use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rockskip_indexer::IndexerConfig;
use serde::Serialize;

use crate::cli::CommonArgs;

/// Runtime configuration shared by the service and the one-shot commands.
#[derive(Clone, Debug, Serialize)]
pub struct RockskipConfig {
    pub database_url: Option<String>,
    pub repos_dir: PathBuf,
    pub max_repos: usize,
    pub indexing_workers: usize,
    pub index_queue_size: usize,
    pub symbols_cache_size: usize,
    pub path_symbols_cache_size: usize,
    pub max_total_paths_length: usize,
    pub search_last_indexed_commit: bool,
    pub timeout_secs: u64,
    pub ctags_command: String,
    pub log_queries: bool,
}

impl Default for RockskipConfig {
    fn default() -> Self {
        let indexer = IndexerConfig::default();
        Self {
            database_url: None,
            repos_dir: PathBuf::from("."),
            max_repos: 1000,
            indexing_workers: 4,
            index_queue_size: 1000,
            symbols_cache_size: indexer.symbols_cache_size,
            path_symbols_cache_size: indexer.path_symbols_cache_size,
            max_total_paths_length: indexer.max_total_paths_length,
            search_last_indexed_commit: false,
            timeout_secs: 60,
            ctags_command: "universal-ctags".to_string(),
            log_queries: false,
        }
    }
}

impl RockskipConfig {
    /// Build a runtime configuration from the CLI arguments.
    pub fn try_from_args(args: CommonArgs) -> Result<Self> {
        let provided = match args.repos_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        let repos_dir = provided.canonicalize().with_context(|| {
            format!(
                "failed to canonicalize repositories directory: {}",
                provided.display()
            )
        })?;

        Ok(Self {
            database_url: args.database_url.filter(|url| !url.trim().is_empty()),
            repos_dir,
            max_repos: usize::max(1, args.max_repos),
            indexing_workers: usize::max(1, args.indexing_workers),
            index_queue_size: usize::max(1, args.index_queue_size),
            symbols_cache_size: usize::max(1, args.symbols_cache_size),
            path_symbols_cache_size: usize::max(1, args.path_symbols_cache_size),
            max_total_paths_length: usize::max(1, args.max_total_paths_length),
            search_last_indexed_commit: args.search_last_indexed_commit,
            timeout_secs: u64::max(1, args.timeout_secs),
            ctags_command: args.ctags_command,
            log_queries: args.log_queries,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            symbols_cache_size: self.symbols_cache_size,
            path_symbols_cache_size: self.path_symbols_cache_size,
            max_total_paths_length: self.max_total_paths_length,
        }
    }
}
