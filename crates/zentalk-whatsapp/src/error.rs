//! Error types for zentalk-whatsapp

use thiserror::Error;

/// WhatsApp relay error type
#[derive(Debug, Error)]
pub enum Error {
    /// Provider API rejected the request
    #[error("provider api error: {0}")]
    Api(String),

    /// Network failure talking to the provider
    #[error("network error: {0}")]
    Network(String),

    /// Webhook payload was structurally invalid
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] zentalk_store::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for zentalk_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Api(detail) | Error::Network(detail) => zentalk_core::Error::Upstream(detail),
            Error::Payload(detail) => zentalk_core::Error::Validation(detail),
            Error::Store(store) => store.into(),
        }
    }
}
