//! Relay client configuration.

use crate::correlation::{DEFAULT_MAX_EXTENSIONS, DEFAULT_REQUEST_TIMEOUT};
use crate::error::RelayError;
use std::time::Duration;

/// Default relay port.
pub const DEFAULT_RELAY_PORT: u16 = 3055;

/// Configuration for a [`RelayClient`](crate::RelayClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL (default: `ws://127.0.0.1:3055`).
    pub url: String,
    /// Reply window for each call (default: 30s).
    pub request_timeout: Duration,
    /// Timeout for a single connection attempt (default: 10s).
    pub connect_timeout: Duration,
    /// First reconnect delay (default: 1s).
    pub reconnect_min_delay: Duration,
    /// Reconnect delay cap (default: 30s).
    pub reconnect_max_delay: Duration,
    /// Reconnect automatically after the socket drops (default: true).
    pub auto_reconnect: bool,
    /// Progress for an outstanding call id extends its deadline (default: true).
    pub progress_keepalive: bool,
    /// Extensions allowed per call before progress stops counting (default: 10).
    pub keepalive_max_extensions: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_RELAY_PORT}"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            auto_reconnect: true,
            progress_keepalive: true,
            keepalive_max_extensions: DEFAULT_MAX_EXTENSIONS,
        }
    }
}

impl ClientConfig {
    /// Create a new config builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EASEL_RELAY_URL` | `ws://127.0.0.1:3055` |
    /// | `EASEL_REQUEST_TIMEOUT_MS` | `30000` |
    /// | `EASEL_CONNECT_TIMEOUT_MS` | `10000` |
    /// | `EASEL_RECONNECT_MIN_MS` | `1000` |
    /// | `EASEL_RECONNECT_MAX_MS` | `30000` |
    /// | `EASEL_AUTO_RECONNECT` | `true` |
    /// | `EASEL_PROGRESS_KEEPALIVE` | `true` |
    /// | `EASEL_KEEPALIVE_MAX_EXTENSIONS` | `10` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            url: std::env::var("EASEL_RELAY_URL").unwrap_or(default.url),
            request_timeout: env_millis("EASEL_REQUEST_TIMEOUT_MS")
                .unwrap_or(default.request_timeout),
            connect_timeout: env_millis("EASEL_CONNECT_TIMEOUT_MS")
                .unwrap_or(default.connect_timeout),
            reconnect_min_delay: env_millis("EASEL_RECONNECT_MIN_MS")
                .unwrap_or(default.reconnect_min_delay),
            reconnect_max_delay: env_millis("EASEL_RECONNECT_MAX_MS")
                .unwrap_or(default.reconnect_max_delay),
            auto_reconnect: env_flag("EASEL_AUTO_RECONNECT").unwrap_or(default.auto_reconnect),
            progress_keepalive: env_flag("EASEL_PROGRESS_KEEPALIVE")
                .unwrap_or(default.progress_keepalive),
            keepalive_max_extensions: std::env::var("EASEL_KEEPALIVE_MAX_EXTENSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.keepalive_max_extensions),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(RelayError::Config(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(RelayError::Config("request_timeout must be > 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(RelayError::Config("connect_timeout must be > 0".into()));
        }
        if self.reconnect_min_delay > self.reconnect_max_delay {
            return Err(RelayError::Config(
                "reconnect_min_delay must not exceed reconnect_max_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Read a millisecond duration from the environment.
pub fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

/// Read a boolean flag; anything but `false`/`0` is true.
pub fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v != "false" && v != "0")
}

/// Builder for ClientConfig.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the relay URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Point at a relay on localhost.
    pub fn port(mut self, port: u16) -> Self {
        self.config.url = format!("ws://127.0.0.1:{port}");
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn reconnect_delay(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_min_delay = min;
        self.config.reconnect_max_delay = max;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn progress_keepalive(mut self, enabled: bool) -> Self {
        self.config.progress_keepalive = enabled;
        self
    }

    /// Cap how often progress may extend one call's deadline.
    pub fn keepalive_max_extensions(mut self, max: u32) -> Self {
        self.config.keepalive_max_extensions = max;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ClientConfig, RelayError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:3055");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.auto_reconnect);
        assert!(config.progress_keepalive);
        assert_eq!(config.keepalive_max_extensions, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_http_url() {
        let result = ClientConfig::builder().url("http://localhost:3055").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = ClientConfig::builder()
            .request_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_inverted_backoff() {
        let result = ClientConfig::builder()
            .reconnect_delay(Duration::from_secs(5), Duration::from_secs(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = ClientConfig::builder()
            .port(4000)
            .request_timeout(Duration::from_secs(5))
            .auto_reconnect(false)
            .build()
            .expect("should build successfully");
        assert_eq!(config.url, "ws://127.0.0.1:4000");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.auto_reconnect);
    }
}
