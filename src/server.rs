//! Server configuration and wiring
//!
//! Loads [`AppConfig`] from an optional TOML file plus `ZENTALK_`-prefixed
//! environment variables, builds every component, and serves the HTTP/WS
//! surface until shutdown.

use anyhow::Context;
use axum::{Extension, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zentalk_core::AuthStore;
use zentalk_llm::{HttpCompletionClient, ReplyGenerator};
use zentalk_realtime::RealtimeHub;
use zentalk_store::{PgRelayStore, RelayStore};
use zentalk_whatsapp::{IngestPipeline, WhatsAppApi, WhatsAppClient};

use crate::api;
use crate::websocket;

// ============================================================================
// Configuration
// ============================================================================

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string; `DATABASE_URL` takes precedence
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Authentication settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// When set, a session token for this user is issued at startup and
    /// printed once to the log. Tokens live in memory only, so a fresh
    /// process needs a fresh credential.
    #[serde(default)]
    pub bootstrap_user_id: Option<i64>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "postgres://localhost/zentalk".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Load configuration from an optional file plus environment overrides.
///
/// Environment variables use the `ZENTALK_` prefix with `__` separating
/// sections, e.g. `ZENTALK_SERVER__PORT=9000`.
pub fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("ZENTALK")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Failed to load configuration")?;

    config
        .try_deserialize()
        .context("Invalid configuration values")
}

// ============================================================================
// Wiring
// ============================================================================

/// Static process information for the health endpoint
pub struct ServerInfo {
    /// Process start time
    pub started_at: Instant,
}

/// Run the relay server until shutdown
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database.url.clone());

    let pool = zentalk_store::connect(&database_url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    zentalk_store::migrate(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn RelayStore> = Arc::new(PgRelayStore::new(pool));
    let auth = Arc::new(AuthStore::new());
    let hub = Arc::new(RealtimeHub::new(auth.clone()));

    if let Some(user_id) = config.auth.bootstrap_user_id {
        let (token, _) = auth
            .issue_token(user_id, "bootstrap")
            .context("Failed to issue bootstrap token")?;
        info!(user_id, "Bootstrap session token (shown once): {}", token);
    }

    let generator = match HttpCompletionClient::from_env() {
        Ok(backend) => Arc::new(ReplyGenerator::new(Arc::new(backend))),
        Err(e) => {
            warn!(error = %e, "Completion backend not configured, canned replies only");
            Arc::new(ReplyGenerator::without_backend())
        }
    };

    let whatsapp: Arc<dyn WhatsAppApi> =
        Arc::new(WhatsAppClient::new().context("Failed to build WhatsApp client")?);
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        generator,
        whatsapp.clone(),
        hub.clone(),
    ));

    let info = Arc::new(ServerInfo {
        started_at: Instant::now(),
    });

    let app = Router::new()
        .merge(api::api_router())
        .merge(websocket::websocket_router())
        .layer(Extension(store))
        .layer(Extension(auth))
        .layer(Extension(hub))
        .layer(Extension(pipeline))
        .layer(Extension(whatsapp))
        .layer(Extension(info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("ZenTalk relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.max_connections, 5);
        assert!(config.auth.bootstrap_user_id.is_none());
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let config = load_config("does-not-exist").unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
