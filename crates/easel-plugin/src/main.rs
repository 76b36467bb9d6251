//! easel-plugin: sandbox endpoint serving the built-in commands over a relay
//! channel.

use easel_plugin::{handlers, ChannelTransport, ConnectionState, PluginConfig, Registry};
use tokio::signal;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("easel_plugin=debug".parse()?),
        )
        .init();

    info!("easel-plugin starting...");

    let config = PluginConfig::from_env();
    let port = config.port;
    let registry = handlers::register_builtin(Registry::builder())?.build();
    info!(commands = ?registry.commands(), "Registered commands");

    let transport = ChannelTransport::new(config, registry);

    let mut states = transport.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state {
                ConnectionState::Joined { channel } => {
                    info!(channel = %channel, "Ready; give this channel token to the automation side")
                }
                other => debug!(state = ?other, "Connection state changed"),
            }
        }
    });

    let channel = transport.connect(port).await?;
    info!(channel = %channel, port, "Channel session started");

    signal::ctrl_c().await?;
    info!("Received shutdown signal");
    transport.disconnect().await;

    Ok(())
}
