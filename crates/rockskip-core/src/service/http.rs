use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Response, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::search::{SearchParams, SymbolMatch};
use crate::server::Server;
use crate::status::StatusReport;

type SharedServer = Arc<Server>;

#[derive(Serialize, Deserialize)]
pub struct HttpSearchResponse {
    pub symbols: Vec<SymbolMatch>,
}

#[derive(Debug, Deserialize)]
pub struct HttpIndexRequest {
    pub repo: String,
    pub commit: String,
    /// Seconds to wait before giving up; indexing continues regardless.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

#[derive(Serialize, Deserialize)]
pub struct HttpIndexResponse {
    pub indexed_commits: usize,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub retryable: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

/// Routes served over HTTP.
pub fn router(server: SharedServer) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/search", post(search))
        .route("/index", post(index))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(server)
}

/// Start the HTTP server and run until shutdown.
pub async fn serve(addr: SocketAddr, server: SharedServer) -> Result<()> {
    let app = router(server);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP address {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .with_context(|| format!("failed to run HTTP server on {addr}"))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn search(
    State(server): State<SharedServer>,
    Json(request): Json<SearchParams>,
) -> Result<Json<HttpSearchResponse>, HttpError> {
    if request.repo.trim().is_empty() || request.commit.trim().is_empty() {
        return Err(bad_request("repo and commit are required"));
    }

    match server.search(request).await {
        Ok(symbols) => Ok(Json(HttpSearchResponse { symbols })),
        Err(err) => Err(error_response(err)),
    }
}

async fn index(
    State(server): State<SharedServer>,
    Json(request): Json<HttpIndexRequest>,
) -> Result<Json<HttpIndexResponse>, HttpError> {
    if request.repo.trim().is_empty() || request.commit.trim().is_empty() {
        return Err(bad_request("repo and commit are required"));
    }
    let timeout = request
        .timeout_secs
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64);

    match server.index(&request.repo, &request.commit, timeout).await {
        Ok(indexed_commits) => Ok(Json(HttpIndexResponse { indexed_commits })),
        Err(err) => Err(error_response(err)),
    }
}

async fn status(State(server): State<SharedServer>) -> Result<Json<StatusReport>, HttpError> {
    server.status().await.map(Json).map_err(error_response)
}

async fn metrics() -> Result<Response<Body>, StatusCode> {
    match crate::telemetry::export_prometheus() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(body))
            .map_err(|err| {
                tracing::error!(error = %err, "failed to build metrics response");
                StatusCode::INTERNAL_SERVER_ERROR
            }),
        Err(err) => {
            tracing::error!(error = %err, "failed to export metrics");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn bad_request(message: &str) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            message: message.to_string(),
            retryable: false,
        }),
    )
}

fn error_response(err: SearchError) -> HttpError {
    let status = match &err {
        SearchError::RepositoryBusy(_) => StatusCode::CONFLICT,
        SearchError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        SearchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        SearchError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
        SearchError::IndexingFailed { .. } | SearchError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            retryable: err.is_retryable(),
            message: format!("{err:#}"),
        }),
    )
}
