//! MCP server settings: relay client options, startup channel and the
//! transports to serve.

use easel_core::{ClientConfig, RelayError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Which MCP transports the binary serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    Stdio,
    Http,
    #[default]
    Both,
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::Transport(other.to_string())),
        }
    }
}

impl TransportMode {
    pub fn stdio_enabled(self) -> bool {
        self != Self::Http
    }

    pub fn http_enabled(self) -> bool {
        self != Self::Stdio
    }
}

/// Configuration for the Easel MCP server.
#[derive(Debug, Clone)]
pub struct EaselConfig {
    /// Relay client settings.
    pub client: ClientConfig,

    /// Channel joined at startup, if any.
    pub default_channel: Option<String>,

    pub transport_mode: TransportMode,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid relay client config: {0}")]
    Client(#[from] RelayError),

    #[error("unknown transport '{0}' (expected stdio, http or both)")]
    Transport(String),
}

impl Default for EaselConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            default_channel: None,
            transport_mode: TransportMode::Both,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
        }
    }
}

impl EaselConfig {
    /// Load configuration from environment variables.
    ///
    /// Relay client variables are documented on [`ClientConfig::from_env`].
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EASEL_DEFAULT_CHANNEL` | unset |
    /// | `EASEL_TRANSPORT` | `both` (stdio, http, both) |
    /// | `EASEL_HTTP_HOST` | `0.0.0.0` |
    /// | `EASEL_HTTP_PORT` | `8080` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr = std::env::var("EASEL_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = std::env::var("EASEL_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        Self {
            client: ClientConfig::from_env(),
            default_channel: std::env::var("EASEL_DEFAULT_CHANNEL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            transport_mode: std::env::var("EASEL_TRANSPORT")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(mode) => Some(mode),
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring EASEL_TRANSPORT");
                        None
                    }
                })
                .unwrap_or(default.transport_mode),
            http_addr: SocketAddr::new(http_host, http_port),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        Ok(())
    }
}
