//! Error types for easel-plugin.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised while building a command registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two handlers were registered under one name.
    #[error("duplicate command: {0}")]
    DuplicateCommand(String),
}

/// Errors raised by the channel transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The relay could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Invalid plugin configuration
    #[error("invalid config: {0}")]
    Config(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
