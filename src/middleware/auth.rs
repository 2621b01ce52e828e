//! Authentication middleware for Axum
//!
//! Extracts Bearer tokens from requests and validates them against the
//! AuthStore. Provides the `RequireAuth` extractor for handlers.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use zentalk_core::{AuthContext, AuthError, AuthStore};

/// JSON error response for auth failures
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    success: bool,
    error: String,
    code: String,
}

impl AuthErrorResponse {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.into(),
        }
    }
}

/// Auth rejection type
pub struct AuthRejection {
    status: StatusCode,
    body: AuthErrorResponse,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for AuthRejection {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                body: AuthErrorResponse::new(
                    "Authentication required. Provide Authorization: Bearer <token>.",
                    "UNAUTHORIZED",
                ),
            },
            AuthError::InvalidCredentials => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                body: AuthErrorResponse::new("Invalid session token", "INVALID_CREDENTIALS"),
            },
            AuthError::TokenRevoked => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                body: AuthErrorResponse::new("Token has been revoked", "TOKEN_REVOKED"),
            },
            AuthError::Internal(msg) => AuthRejection {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: AuthErrorResponse::new(msg, "INTERNAL_ERROR"),
            },
        }
    }
}

// ============================================================================
// RequireAuth Extractor
// ============================================================================

/// Axum extractor that requires a valid session token.
///
/// Extracts the token from:
/// 1. `Authorization: Bearer <token>` header
/// 2. `?token=<token>` query parameter (for WebSocket upgrades)
pub struct RequireAuth(pub AuthContext);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth_store = parts
            .extensions
            .get::<Arc<AuthStore>>()
            .ok_or_else(|| AuthError::Internal("AuthStore not configured".to_string()))?;

        let token = extract_token(parts)?;
        let ctx = auth_store.validate_token(&token)?;

        Ok(RequireAuth(ctx))
    }
}

/// Extract token from request headers or query params
fn extract_token(parts: &Parts) -> std::result::Result<String, AuthError> {
    // 1. Authorization: Bearer <token>
    if let Some(auth_header) = parts.headers.get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Ok(token.trim().to_string());
            }
        }
    }

    // 2. ?token= query parameter (for WebSocket upgrades)
    if let Some(query) = parts.uri.query() {
        for param in query.split('&') {
            if let Some(token) = param.strip_prefix("token=") {
                return Ok(token.to_string());
            }
        }
    }

    Err(AuthError::MissingCredentials)
}
