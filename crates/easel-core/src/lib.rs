//! # easel-core
//!
//! Wire protocol, request correlation and relay client for Easel channels.
//!
//! Easel lets an automation client drive a design tool whose scripting API
//! only exists inside a sandboxed plugin host. Both sides connect to a relay
//! and meet in a named channel; this crate holds everything the two sides
//! share plus the automation-side client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────┐        ┌──────────────────────────┐
//! │ automation server        │        │ easel-relay  │        │ sandbox (easel-plugin)   │
//! │                          │        │              │        │                          │
//! │  RelayClient             │  ws    │  channel     │  ws    │  ChannelTransport        │
//! │   ├─ Correlator ─────────┼───────▶│  "k3x9q2ab"  │───────▶│   └─ Registry            │
//! │   │  (pending calls)     │◀───────┼──────────────┼────────┤       └─ handlers        │
//! │   └─ ProgressStream ◀────┼────────┼── progress ──┼────────┤                          │
//! └──────────────────────────┘        └──────────────┘        └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use easel_core::{ClientConfig, RelayClient};
//! use serde_json::json;
//!
//! # async fn example() -> easel_core::Result<()> {
//! let client = RelayClient::connect(ClientConfig::builder().port(3055).build()?).await?;
//! client.join_channel("k3x9q2ab").await?;
//!
//! let result = client.send_command("echo", json!({"v": 1})).await?;
//! assert_eq!(result, json!({"v": 1}));
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod client;
pub mod config;
pub mod correlation;
mod error;
pub mod progress;
pub mod protocol;

pub use backoff::Backoff;
pub use client::{ConnectionStatus, RelayClient};
pub use config::{ClientConfig, ClientConfigBuilder, DEFAULT_RELAY_PORT};
pub use correlation::{Correlator, PendingReply, DEFAULT_MAX_EXTENSIONS, DEFAULT_REQUEST_TIMEOUT};
pub use error::{RelayError, Result};
pub use progress::{ChunkInfo, ProgressStatus, ProgressStream, ProgressTracker, ProgressUpdate};
pub use protocol::{CommandReply, CommandRequest, Envelope, EnvelopeKind, Inbound};
