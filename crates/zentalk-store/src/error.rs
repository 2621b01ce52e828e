//! Error types for zentalk-store

use thiserror::Error;

/// Store error type
#[derive(Debug, Error)]
pub enum Error {
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Migration failure
    #[error("migration error: {0}")]
    Migration(String),

    /// Stored value failed to parse
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for zentalk_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(detail) => zentalk_core::Error::NotFound(detail),
            other => zentalk_core::Error::Internal(other.to_string()),
        }
    }
}
