//! WhatsApp account management
//!
//! Accounts are reached through the account → client → user ownership
//! chain; every handler requires authentication. Webhook secrets are
//! generated server-side and returned exactly once.

use axum::{
    extract::{Extension, Path, Query},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use zentalk_core::WhatsAppAccount;
use zentalk_store::{NewAccount, RelayStore};

use crate::api::{ensure_client_owner, owned_account, ApiResult};
use crate::middleware::RequireAuth;

/// Account listing filter
#[derive(Debug, Deserialize)]
struct ListAccountsQuery {
    client_id: Option<i64>,
}

/// Account registration request
#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    client_id: i64,
    phone_number: String,
    business_account_id: String,
    access_token: String,
}

/// Credential rotation request
#[derive(Debug, Deserialize)]
struct RotateCredentialsRequest {
    access_token: String,
}

/// Account response carrying the webhook secret.
///
/// Only returned on creation and rotation; normal account reads never
/// include secrets.
#[derive(Debug, Serialize)]
struct AccountWithSecret {
    #[serde(flatten)]
    account: WhatsAppAccount,
    webhook_token: String,
}

fn generate_webhook_token() -> String {
    format!("whsec_{}", Uuid::new_v4().as_simple())
}

/// List the caller's accounts, optionally narrowed to one client
async fn list_accounts(
    RequireAuth(auth): RequireAuth,
    Query(query): Query<ListAccountsQuery>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
) -> ApiResult<Json<Vec<WhatsAppAccount>>> {
    let mut accounts = store.list_accounts_for_user(auth.user_id).await?;
    if let Some(client_id) = query.client_id {
        accounts.retain(|a| a.client_id == client_id);
    }
    Ok(Json(accounts))
}

/// Register a WhatsApp account under one of the caller's clients
async fn create_account(
    RequireAuth(auth): RequireAuth,
    Extension(store): Extension<Arc<dyn RelayStore>>,
    Json(request): Json<CreateAccountRequest>,
) -> ApiResult<Json<AccountWithSecret>> {
    if request.phone_number.trim().is_empty() {
        return Err(zentalk_core::Error::Validation("phone_number is required".to_string()).into());
    }
    if request.business_account_id.trim().is_empty() {
        return Err(
            zentalk_core::Error::Validation("business_account_id is required".to_string()).into(),
        );
    }
    if request.access_token.trim().is_empty() {
        return Err(zentalk_core::Error::Validation("access_token is required".to_string()).into());
    }

    ensure_client_owner(store.as_ref(), &auth, request.client_id).await?;

    let webhook_token = generate_webhook_token();
    let account = store
        .create_account(NewAccount {
            client_id: request.client_id,
            phone_number: request.phone_number,
            business_account_id: request.business_account_id,
            access_token: request.access_token,
            webhook_token: webhook_token.clone(),
        })
        .await?;

    info!(account_id = account.id, client_id = account.client_id, "Account registered");

    Ok(Json(AccountWithSecret {
        account,
        webhook_token,
    }))
}

/// Replace an account's credentials.
///
/// A fresh webhook secret is generated alongside the new access token;
/// the provider-side webhook subscription must be re-verified with it.
async fn rotate_credentials(
    RequireAuth(auth): RequireAuth,
    Path(account_id): Path<i64>,
    Extension(store): Extension<Arc<dyn RelayStore>>,
    Json(request): Json<RotateCredentialsRequest>,
) -> ApiResult<Json<AccountWithSecret>> {
    if request.access_token.trim().is_empty() {
        return Err(zentalk_core::Error::Validation("access_token is required".to_string()).into());
    }

    owned_account(store.as_ref(), &auth, account_id).await?;

    let webhook_token = generate_webhook_token();
    let account = store
        .rotate_account_credentials(account_id, &request.access_token, &webhook_token)
        .await?;

    info!(account_id, "Account credentials rotated");

    Ok(Json(AccountWithSecret {
        account,
        webhook_token,
    }))
}

/// Create account routes
pub fn accounts_routes() -> Router {
    Router::new()
        .route(
            "/api/whatsapp/accounts",
            get(list_accounts).post(create_account),
        )
        .route(
            "/api/whatsapp/accounts/:id/credentials",
            put(rotate_credentials),
        )
}
