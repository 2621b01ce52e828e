//! WhatsApp webhook handlers
//!
//! The GET route answers Meta's registration handshake; the POST route
//! feeds incoming events to the ingestion pipeline. The POST always
//! answers 200 — except for structurally invalid payloads — so the
//! provider never retries events we have already logged.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use zentalk_store::RelayStore;
use zentalk_whatsapp::{verify_challenge, IngestPipeline, VerifyQuery, WebhookPayload};

/// Verify a WhatsApp webhook (GET)
///
/// Meta sends this request during webhook setup to verify ownership of
/// the callback URL. The token must match the account's stored secret.
async fn webhook_verify(
    Path(account_id): Path<i64>,
    Query(query): Query<VerifyQuery>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
) -> impl IntoResponse {
    let account = match store.get_account(account_id).await {
        Ok(account) => account,
        Err(e) => {
            warn!(account_id, error = %e, "Webhook verification for unknown account");
            return (StatusCode::FORBIDDEN, "Verification failed").into_response();
        }
    };

    match verify_challenge(&account, &query) {
        Some(challenge) => challenge.into_response(),
        None => {
            warn!(account_id, "Webhook verification failed");
            (StatusCode::FORBIDDEN, "Verification failed").into_response()
        }
    }
}

/// Handle a WhatsApp webhook event (POST)
///
/// Receives incoming messages and status updates from Meta.
async fn webhook_ingest(
    Path(account_id): Path<i64>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
    Extension(pipeline): Extension<Arc<IngestPipeline>>,
    Json(raw): Json<serde_json::Value>,
) -> impl IntoResponse {
    // Parse from a clone; the untouched raw value goes to the audit log.
    let payload: WebhookPayload = match serde_json::from_value(raw.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(account_id, error = %e, "Malformed webhook payload");
            return (StatusCode::BAD_REQUEST, "Malformed payload").into_response();
        }
    };

    let account = match store.get_account(account_id).await {
        Ok(account) => account,
        Err(e) => {
            // 200 regardless; a retry would not make the account exist.
            warn!(account_id, error = %e, "Webhook for unknown account dropped");
            return StatusCode::OK.into_response();
        }
    };

    info!(account_id, event = %payload.event_type(), "Received webhook event");

    if let Err(e) = pipeline.process_event(&account, raw, payload).await {
        error!(account_id, error = %e, "Failed to process webhook event");
    }

    StatusCode::OK.into_response()
}

/// Create webhook routes
pub fn webhooks_routes() -> Router {
    Router::new().route(
        "/api/whatsapp/webhook/:account_id",
        get(webhook_verify).post(webhook_ingest),
    )
}
