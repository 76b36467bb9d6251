//! Configuration for the sandbox transport.

use crate::error::TransportError;
use easel_core::config::{env_flag, env_millis};
use easel_core::DEFAULT_RELAY_PORT;
use std::time::Duration;

/// Configuration for [`ChannelTransport`](crate::ChannelTransport).
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Relay host.
    pub host: String,

    /// Relay port used by the binary.
    pub port: u16,

    /// Reopen the socket and rejoin after it drops.
    pub auto_reconnect: bool,

    /// First reconnect delay.
    pub reconnect_min_delay: Duration,

    /// Reconnect delay ceiling.
    pub reconnect_max_delay: Duration,

    /// Limit for one connection attempt.
    pub connect_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_RELAY_PORT,
            auto_reconnect: true,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PluginConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EASEL_RELAY_HOST` | `127.0.0.1` |
    /// | `EASEL_RELAY_PORT` | `3055` |
    /// | `EASEL_AUTO_RECONNECT` | `true` |
    /// | `EASEL_RECONNECT_MIN_MS` | `1000` |
    /// | `EASEL_RECONNECT_MAX_MS` | `30000` |
    /// | `EASEL_CONNECT_TIMEOUT_MS` | `10000` |
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            host: std::env::var("EASEL_RELAY_HOST").unwrap_or(default.host),
            port: std::env::var("EASEL_RELAY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.port),
            auto_reconnect: env_flag("EASEL_AUTO_RECONNECT").unwrap_or(default.auto_reconnect),
            reconnect_min_delay: env_millis("EASEL_RECONNECT_MIN_MS")
                .unwrap_or(default.reconnect_min_delay),
            reconnect_max_delay: env_millis("EASEL_RECONNECT_MAX_MS")
                .unwrap_or(default.reconnect_max_delay),
            connect_timeout: env_millis("EASEL_CONNECT_TIMEOUT_MS")
                .unwrap_or(default.connect_timeout),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::Config("relay host must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(TransportError::Config("connect timeout must be non-zero".into()));
        }
        if self.reconnect_min_delay > self.reconnect_max_delay {
            return Err(TransportError::Config(
                "reconnect min delay exceeds max delay".into(),
            ));
        }
        Ok(())
    }

    /// Relay URL for `port`.
    pub fn url(&self, port: u16) -> String {
        format!("ws://{}:{}", self.host, port)
    }
}
