//! # easel-relay
//!
//! Relay server for Easel channels.
//!
//! Sandboxes and automation clients open a WebSocket to the relay and join a
//! channel by name. Every frame a member sends is forwarded to the other
//! members of its channel; the relay never interprets command payloads.
//!
//! ```text
//!   caller ──message──▶ relay ──broadcast──▶ sandbox
//!   caller ◀──broadcast── relay ◀──message── sandbox
//!   caller ◀──progress_update── relay ◀──progress_update── sandbox
//! ```

pub mod config;
pub mod hub;
pub mod server;

pub use config::RelayConfig;
pub use hub::{ClientId, Hub, HubError};
pub use server::{build_router, handle_frame, serve, RelayState};
