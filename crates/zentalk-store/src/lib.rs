//! zentalk-store - PostgreSQL persistence for the ZenTalk relay
//!
//! This crate provides the storage layer:
//! - Migrations: idempotent schema setup
//! - Store: account, conversation, message and webhook-log access

#![forbid(unsafe_code)]

pub mod error;
pub mod migrations;
pub mod store;

pub use error::{Error, Result};
pub use migrations::migrate;
pub use store::{NewAccount, NewConversation, NewMessage, PgRelayStore, RelayStore};

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a connection pool against the given database URL
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| Error::Database(e.to_string()))
}
