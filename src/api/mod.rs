//! REST API for the relay
//!
//! Provides endpoints for:
//! - WhatsApp webhook verification and ingestion
//! - Account registration and credential rotation
//! - Conversation and message listing, manual agent sends
//! - Agent presence changes
//! - Health

pub mod accounts;
pub mod agents;
pub mod conversations;
pub mod error;
pub mod health;
pub mod webhooks;

use axum::Router;
use zentalk_core::{AuthContext, Client, Conversation, WhatsAppAccount};
use zentalk_store::RelayStore;

pub use accounts::accounts_routes;
pub use agents::agents_routes;
pub use conversations::conversations_routes;
pub use error::{ApiError, ApiResult};
pub use health::health_routes;
pub use webhooks::webhooks_routes;

/// Create the API router with all endpoints
pub fn api_router() -> Router {
    Router::new()
        .merge(health_routes())
        .merge(webhooks_routes())
        .merge(accounts_routes())
        .merge(conversations_routes())
        .merge(agents_routes())
}

// ============================================================================
// Ownership chain
// ============================================================================

/// Load a client and check it belongs to the authenticated user
pub(crate) async fn ensure_client_owner(
    store: &dyn RelayStore,
    auth: &AuthContext,
    client_id: i64,
) -> ApiResult<Client> {
    let client = store.get_client(client_id).await?;
    if client.user_id != auth.user_id {
        return Err(zentalk_core::Error::Forbidden(format!(
            "client {} is not owned by user {}",
            client_id, auth.user_id
        ))
        .into());
    }
    Ok(client)
}

/// Load an account and walk the account → client → user chain
pub(crate) async fn owned_account(
    store: &dyn RelayStore,
    auth: &AuthContext,
    account_id: i64,
) -> ApiResult<WhatsAppAccount> {
    let account = store.get_account(account_id).await?;
    ensure_client_owner(store, auth, account.client_id).await?;
    Ok(account)
}

/// Load a conversation and walk the full ownership chain
pub(crate) async fn owned_conversation(
    store: &dyn RelayStore,
    auth: &AuthContext,
    conversation_id: i64,
) -> ApiResult<(Conversation, WhatsAppAccount)> {
    let conversation = store.get_conversation(conversation_id).await?;
    let account = owned_account(store, auth, conversation.whatsapp_account_id).await?;
    Ok((conversation, account))
}
