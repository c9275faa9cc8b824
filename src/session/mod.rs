//! Conversational state: message types shared by the HTTP surface and the
//! model providers, the per-(user, model) agent session, and the manager
//! that owns sessions and stream cancellation.

mod agent;
mod history;
mod manager;

pub use agent::{AgentSession, SamplingParams, TurnInput};
pub use history::{elide_stale_images, redact_stale_tool_text, IMAGE_ELIDED_PLACEHOLDER};
pub use manager::{spawn_sweeper, SessionManager};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::ToolContent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn blocks(role: &str, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// Either the bare-string form or the structured block list. Both appear in
/// the wild; the bare form is kept for backward compatibility with older
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn blocks_mut(&mut self) -> Option<&mut Vec<ContentBlock>> {
        match self {
            MessageContent::Blocks(blocks) => Some(blocks),
            MessageContent::Text(_) => None,
        }
    }

    /// Concatenated text of all text blocks (or the bare string).
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    File {
        file: FileObject,
    },
    /// Internal: the model requested a tool call. Only ever present in
    /// server-held history, never accepted from clients verbatim.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Internal: the outcome of a tool call, spliced into history so the
    /// model sees it on the next turn.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        content: Vec<ToolContent>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Base64 file payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// Split leading system messages off into a system prompt and drop a leading
/// assistant turn (no provider accepts a conversation that opens with one).
pub fn split_system(messages: Vec<ChatMessage>) -> (String, Vec<ChatMessage>) {
    let mut system = String::new();
    let mut rest: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if rest.is_empty() && msg.role == "system" {
            if !system.is_empty() {
                system.push('\n');
            }
            system.push_str(&msg.content.joined_text());
        } else {
            rest.push(msg);
        }
    }
    while rest.first().map(|m| m.role == "assistant").unwrap_or(false) {
        rest.remove(0);
    }
    (system, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_content_accepts_both_wire_forms() {
        let bare: ChatMessage =
            serde_json::from_value(json!({ "role": "user", "content": "hello" })).unwrap();
        assert_eq!(bare.content.joined_text(), "hello");

        let structured: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "look at " },
                { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAA" } },
                { "type": "text", "text": "this" },
            ]
        }))
        .unwrap();
        assert_eq!(structured.content.joined_text(), "look at this");
    }

    #[test]
    fn file_block_deserializes() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                { "type": "file", "file": { "filename": "report.pdf", "file_data": "QUJD" } }
            ]
        }))
        .unwrap();
        match &msg.content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::File { file } => {
                    assert_eq!(file.filename.as_deref(), Some("report.pdf"));
                }
                other => panic!("expected file block, got {other:?}"),
            },
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn split_system_extracts_prompt_and_drops_leading_assistant() {
        let messages = vec![
            ChatMessage::text("system", "be brief"),
            ChatMessage::text("assistant", "stale greeting"),
            ChatMessage::text("user", "hi"),
        ];
        let (system, rest) = split_system(messages);
        assert_eq!(system, "be brief");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].role, "user");
    }

    #[test]
    fn split_system_concatenates_multiple_system_messages() {
        let messages = vec![
            ChatMessage::text("system", "a"),
            ChatMessage::text("system", "b"),
            ChatMessage::text("user", "q"),
        ];
        let (system, rest) = split_system(messages);
        assert_eq!(system, "a\nb");
        assert_eq!(rest.len(), 1);
    }
}
