//! ZenTalk relay server entry point

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod middleware;
mod server;
mod websocket;

/// WhatsApp relay control plane
#[derive(Debug, Parser)]
#[command(name = "zentalk", version, about)]
struct Cli {
    /// Path to an optional TOML config file
    #[arg(long, default_value = "zentalk.toml")]
    config: String,

    /// Override the bind address
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zentalk=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = server::load_config(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    server::run(config).await
}
