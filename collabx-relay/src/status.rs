//! HTTP status and liveness endpoints.
//!
//! - `GET /` reports room and connection totals from the registry
//! - `GET /health` always reports healthy
//!
//! Counts are read independently of the relay's own traffic and may trail
//! it by a few operations.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::error::RelayError;
use crate::registry::RoomRegistry;

/// Response body for `GET /`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub active_rooms: usize,
    pub total_connections: usize,
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
}

/// Build the status router over a shared registry.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

async fn status_handler(State(registry): State<Arc<RoomRegistry>>) -> Json<StatusReport> {
    let counts = registry.snapshot_counts();
    Json(StatusReport {
        status: "CollabX Backend is running",
        active_rooms: counts.rooms,
        total_connections: counts.connections,
    })
}

async fn health_handler() -> Json<HealthReport> {
    Json(HealthReport { status: "healthy" })
}

/// Serve the status endpoints until the listener fails.
pub async fn serve(listener: TcpListener, registry: Arc<RoomRegistry>) -> Result<(), RelayError> {
    log::info!("Status endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry)).await?;
    Ok(())
}
