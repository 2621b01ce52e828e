//! Agent presence endpoint
//!
//! Minimal surface: flipping an agent online/offline. The change is
//! broadcast to every connected dashboard.

use axum::{
    extract::{Extension, Path},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use zentalk_core::{Agent, AgentStatus};
use zentalk_realtime::RealtimeHub;
use zentalk_store::RelayStore;

use crate::api::{ensure_client_owner, ApiResult};
use crate::middleware::RequireAuth;

/// Presence change request
#[derive(Debug, Deserialize)]
struct UpdateAgentStatusRequest {
    status: AgentStatus,
}

/// Set an agent's presence state
async fn update_agent_status(
    RequireAuth(auth): RequireAuth,
    Path(agent_id): Path<i64>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
    Extension(hub): Extension<Arc<RealtimeHub>>,
    Json(request): Json<UpdateAgentStatusRequest>,
) -> ApiResult<Json<Agent>> {
    let agent = store.get_agent(agent_id).await?;
    ensure_client_owner(store.as_ref(), &auth, agent.client_id).await?;

    let updated = store.update_agent_status(agent_id, request.status).await?;
    hub.notify_agent_status(updated.id, updated.status).await;

    info!(agent_id, status = %updated.status, "Agent status changed");
    Ok(Json(updated))
}

/// Create agent routes
pub fn agents_routes() -> Router {
    Router::new().route("/api/whatsapp/agents/:id/status", post(update_agent_status))
}
