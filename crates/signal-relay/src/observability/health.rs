//! Status and health endpoints.
//!
//! - `GET /` - Status summary: version plus live user and room counts
//! - `GET /health` - Liveness probe: process is running and serving
//!
//! Both are unauthenticated read-only views; neither exposes identities
//! or call contents.

use crate::server::AppState;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

/// Response body of `GET /`.
#[derive(Debug, Serialize)]
struct StatusResponse {
    message: &'static str,
    version: &'static str,
    status: &'static str,
    /// Count of registered connections.
    users: usize,
    /// Count of active rooms.
    rooms: usize,
}

/// Response body of `GET /health`.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    /// Seconds since process start.
    uptime: u64,
}

/// Create the status router with the `/` and `/health` endpoints.
pub fn status_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        message: "Signaling relay is running",
        version: env!("CARGO_PKG_VERSION"),
        status: "ok",
        users: state.registry.len().await,
        rooms: state.rooms.len().await,
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}
