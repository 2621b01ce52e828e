//! Conversation and message endpoints
//!
//! Listing plus manual agent sends. Every route walks the
//! conversation → account → client → user ownership chain.

use axum::{
    extract::{Extension, Path, Query},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use zentalk_core::{Conversation, DeliveryStatus, Message, MessageSender, MessageType};
use zentalk_realtime::RealtimeHub;
use zentalk_store::{NewMessage, RelayStore};
use zentalk_whatsapp::WhatsAppApi;

use crate::api::{owned_account, owned_conversation, ApiResult};
use crate::middleware::RequireAuth;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// Pagination parameters
#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Manual send request
#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

/// List an account's conversations, most recently updated first
async fn list_conversations(
    RequireAuth(auth): RequireAuth,
    Path(account_id): Path<i64>,
    Query(page): Query<PageQuery>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
) -> ApiResult<Json<Vec<Conversation>>> {
    owned_account(store.as_ref(), &auth, account_id).await?;
    let conversations = store
        .list_conversations(account_id, page.limit(), page.offset())
        .await?;
    Ok(Json(conversations))
}

/// List a conversation's messages, oldest first
async fn list_messages(
    RequireAuth(auth): RequireAuth,
    Path(conversation_id): Path<i64>,
    Query(page): Query<PageQuery>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
) -> ApiResult<Json<Vec<Message>>> {
    owned_conversation(store.as_ref(), &auth, conversation_id).await?;
    let messages = store
        .list_messages(conversation_id, page.limit(), page.offset())
        .await?;
    Ok(Json(messages))
}

/// Send a message into a conversation on behalf of its agent.
///
/// Unlike the auto-reply path this is synchronous: a failed provider
/// send surfaces as a 502 and nothing is stored.
async fn send_message(
    RequireAuth(auth): RequireAuth,
    Path(conversation_id): Path<i64>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
    Extension(api): Extension<Arc<dyn WhatsAppApi>>,
    Extension(hub): Extension<Arc<RealtimeHub>>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Json<Message>> {
    if request.content.trim().is_empty() {
        return Err(zentalk_core::Error::Validation("content is required".to_string()).into());
    }

    let (conversation, account) =
        owned_conversation(store.as_ref(), &auth, conversation_id).await?;

    let provider_id = api
        .send_text(&account, &conversation.contact_phone_number, &request.content)
        .await?;

    let stored = store
        .insert_message(NewMessage {
            conversation_id,
            provider_message_id: provider_id,
            sender: MessageSender::Agent,
            content: request.content,
            message_type: MessageType::Text,
            status: DeliveryStatus::Sent,
        })
        .await?
        .ok_or_else(|| {
            zentalk_core::Error::Internal("provider returned a duplicate message id".to_string())
        })?;

    store.touch_conversation(conversation_id, Utc::now()).await?;

    hub.notify_new_message(&stored).await;
    match store.get_conversation(conversation_id).await {
        Ok(updated) => {
            hub.notify_conversation_update(&updated).await;
        }
        Err(e) => warn!(conversation_id, error = %e, "Cannot load conversation for push"),
    }

    info!(conversation_id, message_id = stored.id, "Manual message sent");
    Ok(Json(stored))
}

/// Create conversation and message routes
pub fn conversations_routes() -> Router {
    Router::new()
        .route(
            "/api/whatsapp/conversations/:account_id",
            get(list_conversations),
        )
        .route(
            "/api/whatsapp/messages/:conversation_id",
            get(list_messages).post(send_message),
        )
}
