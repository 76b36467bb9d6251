//! easel-relay: channel relay for Easel sandboxes and automation clients.

use easel_relay::{serve, RelayConfig, RelayState};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("easel_relay=info".parse()?),
        )
        .init();

    tracing::info!("easel-relay starting...");

    let config = RelayConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    let listener = TcpListener::bind(config.addr).await?;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
    };

    serve(listener, RelayState::new(), &config, shutdown).await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}
