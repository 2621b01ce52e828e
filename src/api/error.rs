//! HTTP error mapping
//!
//! Every handler returns `ApiResult<T>`; failures carry the core error
//! taxonomy and map to one status code each at the edge.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

/// Handler error wrapping the core taxonomy
#[derive(Debug)]
pub struct ApiError(pub zentalk_core::Error);

/// Handler result alias
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// JSON error body
#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            zentalk_core::Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            zentalk_core::Error::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            zentalk_core::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            zentalk_core::Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            zentalk_core::Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            zentalk_core::Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        if self.0.is_request_local() {
            warn!(error = %self.0, "Request failed");
        } else {
            error!(error = %self.0, "Request failed");
        }

        let body = ErrorBody {
            success: false,
            error: self.0.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<zentalk_core::Error> for ApiError {
    fn from(err: zentalk_core::Error) -> Self {
        Self(err)
    }
}

impl From<zentalk_store::Error> for ApiError {
    fn from(err: zentalk_store::Error) -> Self {
        Self(err.into())
    }
}

impl From<zentalk_whatsapp::Error> for ApiError {
    fn from(err: zentalk_whatsapp::Error) -> Self {
        Self(err.into())
    }
}
