//! Error types for easel-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for easel-core operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the relay client and the correlation layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No socket is open, or no channel has been joined yet.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Failed to open or keep the relay socket.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No reply arrived within the deadline.
    #[error("request {id} timed out after {after:?}")]
    Timeout {
        /// Correlation id of the abandoned call
        id: String,
        /// Window that elapsed
        after: Duration,
    },

    /// The remote handler replied with an error.
    #[error("{0}")]
    Remote(String),

    /// A call with this id is still outstanding.
    #[error("duplicate request id: {0}")]
    DuplicateId(String),

    /// The client was shut down while the call was outstanding.
    #[error("relay client disconnected")]
    Disconnected,

    /// The relay rejected a frame.
    #[error("relay error: {0}")]
    Relay(String),

    /// Invalid client configuration
    #[error("invalid config: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl RelayError {
    /// True for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
