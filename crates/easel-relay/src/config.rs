//! Configuration for the relay server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use easel_core::DEFAULT_RELAY_PORT;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind.
    pub addr: SocketAddr,

    /// Evict channels with no traffic for this long (default: never).
    pub channel_idle_timeout: Option<Duration>,

    /// How often idle channels are swept.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_RELAY_PORT),
            channel_idle_timeout: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EASEL_RELAY_HOST` | `127.0.0.1` |
    /// | `EASEL_RELAY_PORT` | `3055` |
    /// | `EASEL_CHANNEL_IDLE_SECS` | unset (no eviction) |
    pub fn from_env() -> Self {
        let default = Self::default();

        let host: IpAddr = std::env::var("EASEL_RELAY_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.addr.ip());

        let port: u16 = std::env::var("EASEL_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.addr.port());

        let channel_idle_timeout = std::env::var("EASEL_CHANNEL_IDLE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            addr: SocketAddr::new(host, port),
            channel_idle_timeout,
            sweep_interval: default.sweep_interval,
        }
    }
}
