//! Read-only HTTP status surface for dashboards.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::ledger::{LedgerHandle, LedgerStats, ProcessedIssue};
use crate::remediation::worker::ActiveSet;

const DEFAULT_ERROR_LIMIT: u32 = 20;
const MAX_ERROR_LIMIT: u32 = 500;

pub struct StatusState {
    pub ledger: LedgerHandle,
    pub active: ActiveSet,
    pub modules: Vec<String>,
}

pub type SharedStatus = Arc<StatusState>;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub stats: LedgerStats,
    pub in_flight: Vec<String>,
    pub modules: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    pub limit: Option<u32>,
}

struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": self.0})),
        )
            .into_response()
    }
}

pub fn build_router(state: SharedStatus) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/errors", get(get_errors))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<SharedStatus>) -> Result<Json<StatusResponse>, ApiError> {
    let stats = state
        .ledger
        .call(|db| db.stats())
        .await
        .map_err(|e| ApiError(format!("{:#}", e)))?;
    Ok(Json(StatusResponse {
        stats,
        in_flight: state.active.snapshot(),
        modules: state.modules.clone(),
    }))
}

async fn get_errors(
    State(state): State<SharedStatus>,
    Query(query): Query<ErrorsQuery>,
) -> Result<Json<Vec<ProcessedIssue>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ERROR_LIMIT)
        .clamp(1, MAX_ERROR_LIMIT);
    let errors = state
        .ledger
        .call(move |db| db.recent_errors(limit))
        .await
        .map_err(|e| ApiError(format!("{:#}", e)))?;
    Ok(Json(errors))
}

/// Serve the status router on localhost until shutdown is signalled.
pub async fn serve(state: SharedStatus, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Status server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Status server error")?;
    Ok(())
}
