use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rockskip_indexer::{MemoryStore, PostgresStore, Store};
use tokio::try_join;
use tracing::{info, warn};

use crate::cli::ServeArgs;
use crate::config::RockskipConfig;
use crate::server::Server;
use crate::tools::{CtagsParser, GitCli};

use super::{grpc, http};

/// Connections reserved for concurrent searches on top of one per indexing
/// worker and one for the evictor.
const SEARCH_CONNECTIONS: u32 = 32;

/// Configuration applied when launching the Rockskip services.
#[derive(Clone)]
pub struct ServeConfig {
    pub http_addr: SocketAddr,
    pub grpc_addr: SocketAddr,
    pub rockskip: RockskipConfig,
}

impl ServeConfig {
    /// Build a runtime configuration from the CLI arguments.
    pub fn try_from_args(args: ServeArgs) -> Result<Self> {
        Ok(Self {
            http_addr: args.http_addr,
            grpc_addr: args.grpc_addr,
            rockskip: RockskipConfig::try_from_args(args.common)?,
        })
    }
}

/// Open the configured store, creating the schema when it is PostgreSQL.
pub async fn open_store(config: &RockskipConfig) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let max_connections = config.indexing_workers as u32 + 1 + SEARCH_CONNECTIONS;
            let store = PostgresStore::connect(url, max_connections)
                .await
                .context("failed to connect to PostgreSQL")?
                .with_log_queries(config.log_queries);
            store
                .migrate()
                .await
                .context("failed to create the rockskip schema")?;
            info!(max_connections, "using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no --database-url given; the index lives in memory and is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Wire the store and the git/ctags collaborators into a [`Server`].
pub async fn build(config: &RockskipConfig) -> Result<Server> {
    let store = open_store(config).await?;
    let git = Arc::new(GitCli::new(config.repos_dir.clone()));
    let parser = Arc::new(CtagsParser::new(
        config.ctags_command.clone(),
        Duration::from_secs(config.timeout_secs),
        config.indexing_workers,
    ));
    Ok(Server::spawn(store, git, parser, config))
}

/// Top-level service runner that coordinates both HTTP and gRPC servers.
pub struct RockskipServer {
    config: ServeConfig,
}

impl RockskipServer {
    pub fn new(config: ServeConfig) -> Self {
        Self { config }
    }

    /// Run the gRPC and HTTP services until a shutdown signal is received.
    pub async fn run(self) -> Result<()> {
        let grpc_addr = self.config.grpc_addr;
        let http_addr = self.config.http_addr;
        let server = Arc::new(build(&self.config.rockskip).await?);
        info!(%http_addr, %grpc_addr, repos_dir = %self.config.rockskip.repos_dir.display(), "starting rockskip");

        try_join!(
            grpc::serve(grpc_addr, server.clone()),
            http::serve(http_addr, server)
        )?;

        Ok(())
    }
}
