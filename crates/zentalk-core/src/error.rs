//! Error types for zentalk-core
//!
//! One taxonomy covers the whole relay: request-local failures map directly
//! to an HTTP status at the edge, upstream failures are absorbed or logged
//! depending on where they happen.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credential
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Ownership-chain mismatch or webhook-token mismatch
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unknown account, conversation or message
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed payload or request body
    #[error("validation error: {0}")]
    Validation(String),

    /// Completion-service or provider-send call failed
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Unexpected store or logic failure
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error is request-local (caller's fault, no retry)
    #[must_use]
    pub fn is_request_local(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized(_) | Error::Forbidden(_) | Error::NotFound(_) | Error::Validation(_)
        )
    }
}
