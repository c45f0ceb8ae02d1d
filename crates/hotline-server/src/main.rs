//! Hotline relay server.
//!
//! Forwards newline-delimited text frames between connected TCP clients.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use hotline_relay::RelayServer;
use hotline_shutdown::GracefulShutdown;
use tracing::info;

mod cli;
mod config;
mod telemetry;

use cli::Cli;
use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Failed to apply environment overrides")?;
    cli.apply(&mut config);

    telemetry::init(config.log_format).map_err(|e| anyhow!(e))?;

    info!("Starting Hotline relay server");
    config.log_config();

    let server = RelayServer::new(config.relay_config()).context("Invalid relay configuration")?;
    let listener = server
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let shutdown = GracefulShutdown::new(config.drain_timeout());
    let signals = shutdown.clone();
    tokio::spawn(async move {
        signals.stop_on_signal().await;
    });

    server
        .run(listener, shutdown)
        .await
        .context("Relay server failed")?;

    telemetry::shutdown();
    Ok(())
}
