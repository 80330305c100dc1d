use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI definition for rockskip.
#[derive(Parser, Debug)]
#[command(name = "rockskip")]
#[command(about = "Versioned symbol index over first-parent git history", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP and gRPC services.
    Serve(ServeArgs),
    /// Index one commit and exit.
    Index(IndexArgs),
    /// Search one commit (indexing it first if needed) and print JSON.
    Search(SearchArgs),
}

/// Options shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// PostgreSQL connection string. Without it an in-process store is used.
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory holding one git clone per repository, at `<dir>/<repo>`.
    #[arg(long)]
    pub repos_dir: Option<PathBuf>,

    /// Number of repositories kept resident before the least recently used are evicted.
    #[arg(long, default_value_t = 1000)]
    pub max_repos: usize,

    /// Indexing workers; repositories are sharded across them by name.
    #[arg(long, default_value_t = 4)]
    pub indexing_workers: usize,

    /// Pending index requests each worker accepts before rejecting new ones.
    #[arg(long, default_value_t = 1000)]
    pub index_queue_size: usize,

    /// Capacity of the per-run symbol row id cache.
    #[arg(long, default_value_t = 100_000)]
    pub symbols_cache_size: usize,

    /// Capacity of the per-run path to symbol names cache.
    #[arg(long, default_value_t = 10_000)]
    pub path_symbols_cache_size: usize,

    /// Upper bound on the summed length of paths fetched by one archive call.
    #[arg(long, default_value_t = 100_000)]
    pub max_total_paths_length: usize,

    /// Serve searches for unindexed commits from the nearest indexed ancestor.
    #[arg(long, default_value_t = false)]
    pub search_last_indexed_commit: bool,

    /// Default per-request timeout (seconds).
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// universal-ctags executable used to parse files.
    #[arg(long, default_value = "universal-ctags")]
    pub ctags_command: String,

    /// Log planned predicates and generated SQL at debug level.
    #[arg(long, default_value_t = false)]
    pub log_queries: bool,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Address for the HTTP server.
    #[arg(long, default_value = "127.0.0.1:3184")]
    pub http_addr: SocketAddr,

    /// Address for the gRPC server.
    #[arg(long, default_value = "127.0.0.1:3185")]
    pub grpc_addr: SocketAddr,
}

#[derive(clap::Args, Debug)]
pub struct IndexArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Repository name, relative to `--repos-dir`.
    #[arg(long)]
    pub repo: String,

    /// Commit to index.
    #[arg(long)]
    pub commit: String,
}

#[derive(clap::Args, Debug)]
pub struct SearchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long)]
    pub repo: String,

    #[arg(long)]
    pub commit: String,

    /// Symbol name, or a pattern with `--regexp`.
    #[arg(long, default_value = "")]
    pub query: String,

    #[arg(long, default_value_t = false)]
    pub regexp: bool,

    #[arg(long, default_value_t = false)]
    pub case_sensitive: bool,

    /// Path patterns every result must match. Repeatable.
    #[arg(long = "include")]
    pub include_patterns: Vec<String>,

    /// Path pattern results must not match.
    #[arg(long = "exclude", default_value = "")]
    pub exclude_pattern: String,

    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}
