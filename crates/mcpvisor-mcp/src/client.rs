//! MCP capability negotiation and tool invocation over a `StdioChannel`.
//!
//! Only the request/response subset needed to enumerate and call tools is
//! implemented. Reference: <https://spec.modelcontextprotocol.io/>

use std::sync::Arc;
use std::time::Duration;

use mcpvisor_core::{McpTool, ToolCallError};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::transport::{ChannelError, StdioChannel};

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name reported to workers.
pub const CLIENT_NAME: &str = "mcpvisor";

/// Why capability negotiation failed. The worker keeps running regardless.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("initialize failed: {0}")]
    Initialize(ChannelError),

    #[error("initialized notification failed: {0}")]
    Initialized(ChannelError),

    #[error("tools/list failed: {0}")]
    ListTools(ChannelError),

    #[error("invalid {method} response: {reason}")]
    InvalidResponse { method: &'static str, reason: String },

    #[error("handshake did not complete within {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),
}

/// MCP initialize result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
}

/// Server information from initialize.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Server capabilities. Only `tools` matters here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
}

/// MCP tool from tools/list.
#[derive(Debug, Deserialize)]
struct ToolSchema {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

impl From<ToolSchema> for McpTool {
    fn from(t: ToolSchema) -> Self {
        Self {
            name: t.name,
            description: t.description,
            input_schema: t.input_schema,
        }
    }
}

/// A negotiated session with one worker.
#[derive(Debug)]
pub struct CapabilityClient {
    server_name: String,
    channel: Arc<StdioChannel>,
    info: InitializeResult,
    tools: Vec<McpTool>,
}

impl CapabilityClient {
    /// Run the handshake: `initialize`, `notifications/initialized`, then
    /// `tools/list` when the server declares the tools capability.
    ///
    /// The whole exchange is bounded by `handshake_timeout`.
    pub async fn negotiate(
        server_name: impl Into<String>,
        channel: Arc<StdioChannel>,
        handshake_timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        let server_name = server_name.into();
        tokio::time::timeout(
            handshake_timeout,
            Self::handshake(server_name, channel, handshake_timeout),
        )
        .await
        .map_err(|_| CapabilityError::HandshakeTimeout(handshake_timeout))?
    }

    async fn handshake(
        server_name: String,
        channel: Arc<StdioChannel>,
        timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {}
        });

        let raw = channel
            .request("initialize", Some(params), timeout)
            .await
            .map_err(CapabilityError::Initialize)?;
        let info: InitializeResult =
            serde_json::from_value(raw).map_err(|e| CapabilityError::InvalidResponse {
                method: "initialize",
                reason: e.to_string(),
            })?;

        channel
            .notify("notifications/initialized", None)
            .await
            .map_err(CapabilityError::Initialized)?;

        let tools = if info.capabilities.tools.is_some() {
            list_tools(&channel, timeout).await?
        } else {
            debug!(server_name = %server_name, "Server does not declare tools capability");
            Vec::new()
        };

        info!(
            server_name = %server_name,
            protocol = %info.protocol_version,
            tools = tools.len(),
            "Capability negotiation complete"
        );

        Ok(Self {
            server_name,
            channel,
            info,
            tools,
        })
    }

    /// Invoke a tool and return the worker's result payload unchanged.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolCallError> {
        if !self.has_tool(tool) {
            return Err(ToolCallError::ToolNotFound {
                server: self.server_name.clone(),
                tool: tool.to_string(),
            });
        }

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let params = json!({
            "name": tool,
            "arguments": arguments
        });

        let result = self
            .channel
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| match e {
                ChannelError::Timeout(_) => ToolCallError::Timeout {
                    server: self.server_name.clone(),
                },
                other => ToolCallError::UpstreamError {
                    server: self.server_name.clone(),
                    message: other.to_string(),
                },
            })?;

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            return Err(ToolCallError::UpstreamError {
                server: self.server_name.clone(),
                message: error_text(&result),
            });
        }

        Ok(result)
    }

    /// Release the session. Never fails.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub const fn info(&self) -> &InitializeResult {
        &self.info
    }
}

async fn list_tools(
    channel: &StdioChannel,
    timeout: Duration,
) -> Result<Vec<McpTool>, CapabilityError> {
    let result = channel
        .request("tools/list", None, timeout)
        .await
        .map_err(CapabilityError::ListTools)?;

    let tools_value = result.get("tools").cloned().unwrap_or_else(|| json!([]));
    let tools: Vec<ToolSchema> =
        serde_json::from_value(tools_value).map_err(|e| CapabilityError::InvalidResponse {
            method: "tools/list",
            reason: e.to_string(),
        })?;

    Ok(tools.into_iter().map(McpTool::from).collect())
}

/// First text item of an error result's content, if any.
fn error_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find_map(|item| item.get("text")))
        .and_then(Value::as_str)
        .unwrap_or("tool reported an error")
        .to_string()
}
