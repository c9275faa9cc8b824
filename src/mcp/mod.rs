//! MCP tool-server domain: user-supplied server specs, subprocess clients,
//! and the per-user supervisor that owns them.

mod client;
mod supervisor;

pub use client::{ClientState, McpClient};
pub use supervisor::{McpSupervisor, ServerListEntry};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between a server id and a tool name in the prefixed form
/// exposed to the model (`{server_id}__{tool_name}`).
pub const TOOL_PREFIX_SEP: &str = "__";

/// A validated, persistable declaration of one MCP server. This is the only
/// shape that ever reaches the config store; `status` is derived at list
/// time and never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Registered,
    Connecting,
    Ready,
    Failed,
}

/// A tool discovered from a connected server, carrying routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Original tool name as reported by the server.
    pub name: String,
    /// Name exposed to the model: `{server_id}__{name}`.
    pub prefixed_name: String,
    pub server_id: String,
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    pub input_schema: Value,
}

/// One typed block of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Image { media_type: String, data: String },
    Structured { value: Value },
}

impl ToolContent {
    /// Parse one entry of an MCP `tools/call` result `content` array.
    pub fn from_mcp_value(v: &Value) -> Self {
        match v.get("type").and_then(|t| t.as_str()) {
            Some("text") => ToolContent::Text {
                text: v.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
            },
            Some("image") => ToolContent::Image {
                media_type: v
                    .get("mimeType")
                    .and_then(|m| m.as_str())
                    .unwrap_or("image/png")
                    .to_string(),
                data: v.get("data").and_then(|d| d.as_str()).unwrap_or_default().to_string(),
            },
            _ => ToolContent::Structured { value: v.clone() },
        }
    }
}

/// Outcome of one tool invocation, as surfaced to the session loop and the
/// client. Errors are data here, not control flow: a failed tool call feeds
/// back into the model so it can react.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub server_id: String,
    pub tool_name: String,
    pub is_error: bool,
    pub content: Vec<ToolContent>,
}

impl ToolCallResult {
    pub fn error(server_id: &str, tool_name: &str, message: String) -> Self {
        Self {
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            is_error: true,
            content: vec![ToolContent::Text { text: message }],
        }
    }
}
