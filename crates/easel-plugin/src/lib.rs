//! # easel-plugin
//!
//! Sandbox side of an Easel channel.
//!
//! The sandbox connects to the relay, joins a generated channel token and
//! waits for command requests. Each request is dispatched through a
//! [`Registry`] of named handlers; the reply goes back over the same socket.
//! Long-running handlers report progress through their [`HandlerContext`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use easel_plugin::{handlers, ChannelTransport, PluginConfig, Registry};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = handlers::register_builtin(Registry::builder())?.build();
//! let config = PluginConfig::from_env();
//! let port = config.port;
//!
//! let transport = ChannelTransport::new(config, registry);
//! let channel = transport.connect(port).await?;
//! println!("Channel token: {channel}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
mod error;
pub mod handlers;
pub mod transport;

pub use config::PluginConfig;
pub use dispatch::{
    handler_fn, CommandHandler, HandlerContext, ProgressReporter, Registry, RegistryBuilder,
};
pub use error::{RegistryError, Result, TransportError};
pub use transport::{ChannelTransport, ConnectionState};
