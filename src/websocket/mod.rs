//! WebSocket surface
//!
//! One endpoint, `/ws`, carrying the realtime relay protocol.

pub mod relay;

pub use relay::relay_handler;

use axum::{routing::get, Router};

/// Create the WebSocket router
pub fn websocket_router() -> Router {
    Router::new().route("/ws", get(relay_handler))
}
