//! Provider A: Anthropic-style Messages API. The upstream emits discrete
//! content-block start/stop frames and structured tool-use blocks, which
//! lift directly into canonical events; tool input arrives as
//! `input_json_delta` fragments that are accumulated per block index.

use std::collections::HashMap;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::mcp::ToolContent;
use crate::provider::{
    send_with_retry, ProviderConfig, SseFrameParser, ToolCall, TurnOutput, TurnRequest, TurnStop,
};
use crate::session::{ChatMessage, ContentBlock, MessageContent};
use crate::stream::StreamEvent;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(super) async fn stream_turn(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    req: TurnRequest<'_>,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<TurnOutput, GatewayError> {
    let url = format!("{}/v1/messages", cfg.base_url.trim_end_matches('/'));
    let body = build_body(&req);

    let resp = send_with_retry(|| {
        client
            .post(&url)
            .header("x-api-key", &cfg.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
    })
    .await?;

    let mut parser = SseFrameParser::new();
    let mut state = TurnState::default();
    let mut stream = resp.bytes_stream();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(state.into_output(TurnStop::Cancelled)),
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.feed(&String::from_utf8_lossy(&bytes)) {
                            let Some(frame) = frame else { continue };
                            for event in state.handle(&frame)? {
                                if tx.send(event).await.is_err() {
                                    return Ok(state.into_output(TurnStop::Cancelled));
                                }
                            }
                        }
                        if state.done {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(GatewayError::ModelUpstream(e.to_string())),
                    None => {
                        for frame in parser.flush() {
                            let Some(frame) = frame else { continue };
                            for event in state.handle(&frame)? {
                                if tx.send(event).await.is_err() {
                                    return Ok(state.into_output(TurnStop::Cancelled));
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    let stop = state.stop.unwrap_or(TurnStop::EndTurn);
    Ok(state.into_output(stop))
}

enum Block {
    Text,
    Thinking,
    ToolUse { id: String, name: String, input: String },
}

#[derive(Default)]
struct TurnState {
    text: String,
    tool_calls: Vec<ToolCall>,
    blocks: HashMap<u64, Block>,
    stop: Option<TurnStop>,
    done: bool,
}

impl TurnState {
    fn into_output(self, stop: TurnStop) -> TurnOutput {
        TurnOutput {
            text: self.text,
            tool_calls: self.tool_calls,
            stop,
        }
    }

    /// Translate one upstream frame into zero or more canonical events.
    fn handle(&mut self, frame: &Value) -> Result<Vec<StreamEvent>, GatewayError> {
        let mut events = Vec::new();
        match frame.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => events.push(StreamEvent::MessageStart),
            Some("content_block_start") => {
                let index = frame.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let block = &frame["content_block"];
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        events.push(StreamEvent::ToolName(name.clone()));
                        self.blocks.insert(index, Block::ToolUse { id, name, input: String::new() });
                    }
                    Some("thinking") => {
                        self.blocks.insert(index, Block::Thinking);
                    }
                    _ => {
                        self.blocks.insert(index, Block::Text);
                    }
                }
            }
            Some("content_block_delta") => {
                let index = frame.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let delta = &frame["delta"];
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            self.text.push_str(text);
                            events.push(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta["thinking"].as_str() {
                            events.push(StreamEvent::ThinkingDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) = delta["partial_json"].as_str() {
                            if let Some(Block::ToolUse { input, .. }) = self.blocks.get_mut(&index)
                            {
                                input.push_str(fragment);
                            }
                            events.push(StreamEvent::ToolInputDelta(fragment.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let index = frame.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                if let Some(Block::ToolUse { id, name, input }) = self.blocks.remove(&index) {
                    let parsed = if input.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&input).map_err(|e| {
                            GatewayError::ModelUpstream(format!("bad tool input JSON: {e}"))
                        })?
                    };
                    self.tool_calls.push(ToolCall { id, name, input: parsed });
                    events.push(StreamEvent::ToolInputEnd);
                }
            }
            Some("message_delta") => {
                self.stop = match frame.pointer("/delta/stop_reason").and_then(|s| s.as_str()) {
                    Some("tool_use") => Some(TurnStop::ToolUse),
                    Some("max_tokens") => Some(TurnStop::MaxTokens),
                    Some(_) => Some(TurnStop::EndTurn),
                    None => self.stop,
                };
            }
            Some("message_stop") => self.done = true,
            Some("error") => {
                let message = frame
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown upstream error");
                return Err(GatewayError::ModelUpstream(message.to_string()));
            }
            _ => {} // ping and future event types
        }
        Ok(events)
    }
}

fn build_body(req: &TurnRequest<'_>) -> Value {
    let mut body = json!({
        "model": req.model,
        "max_tokens": req.sampling.max_tokens,
        "temperature": req.sampling.temperature,
        "stream": true,
        "messages": req.messages.iter().map(convert_message).collect::<Vec<_>>(),
    });
    if !req.system.is_empty() {
        body["system"] = json!(req.system);
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.prefixed_name,
                    "description": t.description.clone().unwrap_or_default(),
                    "input_schema": t.input_schema,
                })
            })
            .collect::<Vec<_>>());
    }
    if req.sampling.enable_thinking {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": req.sampling.budget_tokens,
        });
    }
    body
}

fn convert_message(msg: &ChatMessage) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Text(text) => vec![json!({ "type": "text", "text": text })],
        MessageContent::Blocks(blocks) => blocks.iter().filter_map(convert_block).collect(),
    };
    json!({ "role": msg.role, "content": content })
}

fn convert_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::ImageUrl { image_url } => Some(convert_image_url(&image_url.url)),
        ContentBlock::File { file } => {
            let is_pdf = file
                .filename
                .as_deref()
                .map(|f| f.to_ascii_lowercase().ends_with(".pdf"))
                .unwrap_or(false);
            match (&file.file_data, is_pdf) {
                (Some(data), true) => Some(json!({
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": "application/pdf",
                        "data": data,
                    }
                })),
                _ => Some(json!({
                    "type": "text",
                    "text": format!(
                        "[attached file: {}]",
                        file.filename.as_deref().unwrap_or("unnamed")
                    ),
                })),
            }
        }
        ContentBlock::ToolUse { id, name, input } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        })),
        ContentBlock::ToolResult { tool_use_id, is_error, content } => Some(json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "is_error": is_error,
            "content": content.iter().map(convert_tool_content).collect::<Vec<_>>(),
        })),
    }
}

fn convert_tool_content(content: &ToolContent) -> Value {
    match content {
        ToolContent::Text { text } => json!({ "type": "text", "text": text }),
        ToolContent::Image { media_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        ToolContent::Structured { value } => {
            json!({ "type": "text", "text": value.to_string() })
        }
    }
}

/// Inline `data:` URIs become base64 sources; anything else is passed as a
/// URL source.
fn convert_image_url(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}
