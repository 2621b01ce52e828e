//! Health endpoint

use axum::{routing::get, Extension, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use zentalk_realtime::RealtimeHub;

use crate::server::ServerInfo;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub realtime_connections: usize,
}

/// Basic liveness check with process and hub information
async fn health_check(
    Extension(info): Extension<Arc<ServerInfo>>,
    Extension(hub): Extension<Arc<RealtimeHub>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: info.started_at.elapsed().as_secs(),
        realtime_connections: hub.connection_count().await,
    })
}

/// Create health routes
pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_check))
}
