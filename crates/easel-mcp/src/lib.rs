//! # easel-mcp
//!
//! MCP front end for Easel channels: exposes a relay client as tools over
//! stdio and streamable HTTP.

pub mod config;
pub mod http;
pub mod progress;
pub mod server;
pub mod types;

pub use config::{ConfigError, EaselConfig, TransportMode};
pub use server::EaselServer;
