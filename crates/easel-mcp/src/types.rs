//! Tool parameter and response types for MCP tools.
//!
//! These types use serde for serialization and schemars for automatic
//! JSON Schema generation required by MCP.

use easel_core::ProgressUpdate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Channel
// ============================================================================

/// Parameters for joining a channel.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct JoinChannelParams {
    /// Channel token shown by the sandbox.
    pub channel: String,
}

/// Result of joining a channel.
#[derive(Debug, Serialize, JsonSchema)]
pub struct JoinChannelResult {
    /// Channel now joined.
    pub channel: String,
    /// Whether the join was acknowledged.
    pub joined: bool,
}

// ============================================================================
// Commands
// ============================================================================

/// Parameters for sending a command to the sandbox.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandParams {
    /// Registered command name.
    pub command: String,

    /// Command parameters (default: none).
    #[serde(default)]
    pub params: Option<Value>,

    /// Reply window in milliseconds (default: client request timeout).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Result of a command.
#[derive(Debug, Serialize, JsonSchema)]
pub struct SendCommandResult {
    /// Command that was run.
    pub command: String,
    /// Value returned by the sandbox handler.
    pub result: Value,
}

// ============================================================================
// Progress
// ============================================================================

/// Parameters for reading progress.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetProgressParams {
    /// Only this command id (default: all tracked commands).
    #[serde(default)]
    pub command_id: Option<String>,
}

/// Latest progress per command.
#[derive(Debug, Serialize)]
pub struct GetProgressResult {
    pub updates: Vec<ProgressUpdate>,
}
