use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tonic::async_trait;
use tonic::transport::Server as TonicServer;
use tonic::{Request, Response, Status};

use crate::error::SearchError;
use crate::search::{SearchParams, SymbolMatch};
use crate::server::Server;

use super::proto::{
    self,
    rockskip_service_server::{RockskipService, RockskipServiceServer},
};

/// Start the gRPC server and block until shutdown.
pub async fn serve(addr: SocketAddr, server: Arc<Server>) -> Result<()> {
    let service = RockskipGrpc { server };

    TonicServer::builder()
        .add_service(RockskipServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .with_context(|| format!("failed to start gRPC server on {addr}"))
}

#[derive(Clone)]
struct RockskipGrpc {
    server: Arc<Server>,
}

#[async_trait]
impl RockskipService for RockskipGrpc {
    async fn search(
        &self,
        request: Request<proto::SearchRequest>,
    ) -> Result<Response<proto::SearchResponse>, Status> {
        let params = map_request(request.into_inner());
        if params.repo.trim().is_empty() || params.commit.trim().is_empty() {
            return Err(Status::invalid_argument("repo and commit_id are required"));
        }

        let symbols = self.server.search(params).await.map_err(to_status)?;
        let response = proto::SearchResponse {
            symbols: symbols.into_iter().map(Into::into).collect(),
        };
        Ok(Response::new(response))
    }

    async fn index(
        &self,
        request: Request<proto::IndexRequest>,
    ) -> Result<Response<proto::IndexResponse>, Status> {
        let inner = request.into_inner();
        if inner.repo.trim().is_empty() || inner.commit_id.trim().is_empty() {
            return Err(Status::invalid_argument("repo and commit_id are required"));
        }
        let timeout = inner.timeout.and_then(duration_from_proto);
        let indexed = self
            .server
            .index(&inner.repo, &inner.commit_id, timeout)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::IndexResponse {
            indexed_commits: u32::try_from(indexed).unwrap_or(u32::MAX),
        }))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        let response = proto::HealthCheckResponse {
            status: "ok".to_string(),
        };
        Ok(Response::new(response))
    }
}

fn map_request(proto: proto::SearchRequest) -> SearchParams {
    SearchParams {
        repo: proto.repo,
        commit: proto.commit_id,
        query: proto.query,
        is_regexp: proto.is_reg_exp,
        is_case_sensitive: proto.is_case_sensitive,
        include_patterns: proto.include_patterns,
        exclude_pattern: proto.exclude_pattern,
        limit: usize::try_from(proto.first).ok().filter(|limit| *limit > 0),
        timeout: proto.timeout.and_then(duration_from_proto),
    }
}

/// Non-positive or malformed durations mean "use the server default".
fn duration_from_proto(duration: prost_types::Duration) -> Option<Duration> {
    let duration = Duration::try_from(duration).ok()?;
    if duration.is_zero() { None } else { Some(duration) }
}

fn to_status(err: SearchError) -> Status {
    let message = format!("{err:#}");
    match err {
        SearchError::RepositoryBusy(_) => Status::unavailable(message),
        SearchError::QueueFull(_) => Status::resource_exhausted(message),
        SearchError::Timeout => Status::deadline_exceeded(message),
        SearchError::InvalidPattern(_) => Status::invalid_argument(message),
        SearchError::IndexingFailed { .. } | SearchError::Internal(_) => Status::internal(message),
    }
}

fn clamp_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl From<SymbolMatch> for proto::search_response::Symbol {
    fn from(symbol: SymbolMatch) -> Self {
        proto::search_response::Symbol {
            name: symbol.name,
            path: symbol.path,
            line: clamp_i32(symbol.line),
            character: clamp_i32(symbol.character),
            kind: symbol.kind,
            language: symbol.language,
            parent: symbol.parent,
            parent_kind: symbol.parent_kind,
        }
    }
}
