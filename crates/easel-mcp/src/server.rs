//! EaselServer - MCP server that exposes a relay channel as tools.
//!
//! Tools let an agent join the channel a sandbox announced, send it
//! commands, and read the progress the sandbox reports for long-running ones.

use crate::config::EaselConfig;
use crate::progress::ProgressLog;
use crate::types::*;

use easel_core::{ConnectionStatus, ProgressUpdate, RelayClient};
use parking_lot::Mutex;
use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData,
};
use schemars::schema_for;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;

type ProgressTable = Arc<Mutex<ProgressLog>>;

/// MCP server for Easel channels.
///
/// The relay client is created on first use and shared by all sessions.
#[derive(Clone)]
pub struct EaselServer {
    /// Configuration
    config: EaselConfig,

    /// Relay client, connected lazily
    client: Arc<TokioMutex<Option<RelayClient>>>,

    /// Latest progress update per command id
    progress: ProgressTable,

    /// Last channel joined through this server, rejoined by a fresh client
    joined: Arc<Mutex<Option<String>>>,
}

impl EaselServer {
    /// Create a new EaselServer with the given configuration.
    pub fn new(config: EaselConfig) -> Self {
        Self {
            config,
            client: Arc::new(TokioMutex::new(None)),
            progress: Arc::new(Mutex::new(ProgressLog::default())),
            joined: Arc::new(Mutex::new(None)),
        }
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &EaselConfig {
        &self.config
    }

    /// Connected relay client, connecting first if needed.
    ///
    /// A cached client that has closed for good (socket lost with
    /// auto-reconnect off) is replaced, and the new one rejoins the last
    /// channel joined through this server.
    pub async fn client(&self) -> Result<RelayClient, easel_core::RelayError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::info!("Relay client closed, opening a new one");
            *slot = None;
        }

        let client = RelayClient::connect(self.config.client.clone()).await?;
        let table = Arc::clone(&self.progress);
        client.progress().listen("mcp-progress", move |update: ProgressUpdate| {
            table.lock().record(update);
            Ok::<(), Infallible>(())
        });

        *slot = Some(client.clone());

        let rejoin = self.joined.lock().clone();
        if let Some(channel) = rejoin {
            match client.join_channel(&channel).await {
                Ok(()) => tracing::info!(channel = %channel, "Rejoined channel on new relay client"),
                Err(e) => tracing::warn!(channel = %channel, error = %e, "Could not rejoin channel"),
            }
        }
        Ok(client)
    }

    async fn join(&self, channel: &str) -> Result<(), easel_core::RelayError> {
        self.client().await?.join_channel(channel).await?;
        *self.joined.lock() = Some(channel.trim().to_string());
        Ok(())
    }

    /// Join the configured default channel, if any.
    pub async fn join_default_channel(&self) {
        let Some(channel) = self.config.default_channel.clone() else {
            return;
        };
        match self.join(&channel).await {
            Ok(()) => tracing::info!(channel = %channel, "Joined default channel"),
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Could not join default channel"),
        }
    }

    /// Relay link as seen by the cached client; disconnected before first use.
    pub async fn relay_status(&self) -> ConnectionStatus {
        match self.client.lock().await.as_ref() {
            Some(client) => client.status(),
            None => ConnectionStatus {
                connected: false,
                channel: None,
                pending_calls: 0,
                url: self.config.client.url.clone(),
            },
        }
    }

    /// Close the relay client.
    pub async fn shutdown(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
    }

    /// Helper to create success result with JSON content
    fn json_result<T: serde::Serialize>(data: &T) -> CallToolResult {
        match serde_json::to_string_pretty(data) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => CallToolResult::error(vec![Content::text(format!(
                "JSON serialization error: {e}"
            ))]),
        }
    }

    /// Helper to create error result
    fn error_result(message: impl Into<String>) -> CallToolResult {
        CallToolResult::error(vec![Content::text(message.into())])
    }

    /// Convert schemars RootSchema to rmcp JsonObject
    fn schema_to_json_object<T: schemars::JsonSchema>() -> Arc<serde_json::Map<String, Value>> {
        let schema = schema_for!(T);
        let json = serde_json::to_value(&schema.schema).unwrap_or_else(|_| serde_json::json!({}));
        match json {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        }
    }

    /// Create an empty schema for tools with no parameters
    fn empty_schema() -> Arc<serde_json::Map<String, Value>> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), serde_json::json!("object"));
        map.insert("properties".into(), serde_json::json!({}));
        Arc::new(map)
    }

    // ========================================================================
    // Tool Implementations
    // ========================================================================

    /// Run a tool by name.
    pub async fn run_tool(
        &self,
        name: &str,
        args: Option<serde_json::Map<String, Value>>,
    ) -> CallToolResult {
        match name {
            "join_channel" => self.handle_join_channel(args).await,
            "send_command" => self.handle_send_command(args).await,
            "connection_status" => self.handle_connection_status().await,
            "get_progress" => self.handle_get_progress(args),
            _ => Self::error_result(format!("Unknown tool: {name}")),
        }
    }

    async fn handle_join_channel(&self, args: Option<serde_json::Map<String, Value>>) -> CallToolResult {
        let params: JoinChannelParams = match args
            .map(|a| serde_json::from_value(Value::Object(a)))
            .transpose()
        {
            Ok(Some(p)) => p,
            _ => return Self::error_result("Missing required parameter: channel"),
        };

        if let Err(e) = self.client().await {
            return Self::error_result(format!("Failed to connect to relay: {e}"));
        }

        match self.join(&params.channel).await {
            Ok(()) => {
                tracing::info!(channel = %params.channel, "Joined channel");
                Self::json_result(&JoinChannelResult {
                    channel: params.channel.trim().to_string(),
                    joined: true,
                })
            }
            Err(e) => {
                tracing::error!(channel = %params.channel, error = %e, "Failed to join channel");
                Self::error_result(format!("Failed to join channel: {e}"))
            }
        }
    }

    async fn handle_send_command(&self, args: Option<serde_json::Map<String, Value>>) -> CallToolResult {
        let params: SendCommandParams = match args
            .map(|a| serde_json::from_value(Value::Object(a)))
            .transpose()
        {
            Ok(Some(p)) => p,
            _ => return Self::error_result("Missing required parameter: command"),
        };

        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => return Self::error_result(format!("Failed to connect to relay: {e}")),
        };

        let command_params = params.params.unwrap_or(Value::Null);
        tracing::info!(command = %params.command, "Sending command");
        let outcome = match params.timeout_ms.filter(|ms| *ms > 0) {
            Some(ms) => {
                client
                    .send_command_with_timeout(&params.command, command_params, Duration::from_millis(ms))
                    .await
            }
            None => client.send_command(&params.command, command_params).await,
        };

        match outcome {
            Ok(result) => Self::json_result(&SendCommandResult {
                command: params.command,
                result,
            }),
            Err(e) => {
                tracing::warn!(command = %params.command, error = %e, "Command failed");
                Self::error_result(format!("Command '{}' failed: {e}", params.command))
            }
        }
    }

    async fn handle_connection_status(&self) -> CallToolResult {
        Self::json_result(&self.relay_status().await)
    }

    fn handle_get_progress(&self, args: Option<serde_json::Map<String, Value>>) -> CallToolResult {
        let params: GetProgressParams = args
            .and_then(|a| serde_json::from_value(Value::Object(a)).ok())
            .unwrap_or_default();

        let log = self.progress.lock();
        let updates = match params.command_id {
            Some(id) => match log.get(&id) {
                Some(update) => vec![update.clone()],
                None => return Self::error_result(format!("No progress recorded for {id}")),
            },
            None => log.all(),
        };
        Self::json_result(&GetProgressResult { updates })
    }

    /// Build the list of available tools
    fn build_tools_list() -> Vec<Tool> {
        vec![
            Tool::new(
                "join_channel",
                "Join the relay channel announced by the sandbox. Required before send_command.",
                Self::schema_to_json_object::<JoinChannelParams>(),
            ),
            Tool::new(
                "send_command",
                "Send a command to the sandbox on the joined channel and wait for its result.",
                Self::schema_to_json_object::<SendCommandParams>(),
            ),
            Tool::new(
                "connection_status",
                "Show the relay connection, joined channel and outstanding calls.",
                Self::empty_schema(),
            ),
            Tool::new(
                "get_progress",
                "Latest progress reported for long-running commands.",
                Self::schema_to_json_object::<GetProgressParams>(),
            ),
        ]
    }

    #[cfg(test)]
    fn record_progress(&self, update: ProgressUpdate) {
        self.progress.lock().record(update);
    }
}

// ============================================================================
// ServerHandler Implementation
// ============================================================================

impl ServerHandler for EaselServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Easel MCP Server - Drive a sandboxed design tool through a relay channel. \
                 Use join_channel with the token the sandbox shows, then send_command to run \
                 its commands. Use get_progress to follow long-running commands and \
                 connection_status to check the link."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: Self::build_tools_list(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        Ok(self.run_tool(request.name.as_ref(), request.arguments).await)
    }
}
