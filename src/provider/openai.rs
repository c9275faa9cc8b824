//! Provider B: OpenAI-compatible chat completions. Tool calls arrive as
//! incremental JSON fragments under `delta.tool_calls`; the adapter
//! accumulates them per index and synthesizes the canonical end marker when
//! the upstream reports `finish_reason: "tool_calls"`.

use std::collections::BTreeMap;

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

pub(super) async fn stream_turn(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    req: TurnRequest<'_>,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<TurnOutput, GatewayError> {
    let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
    let body = build_body(&req);

    let resp = send_with_retry(|| {
        client
            .post(&url)
            .bearer_auth(&cfg.api_key)
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
                            for event in state.handle(frame.as_ref())? {
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
                            for event in state.handle(frame.as_ref())? {
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

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct TurnState {
    text: String,
    calls: BTreeMap<u64, PendingCall>,
    stop: Option<TurnStop>,
    done: bool,
}

impl TurnState {
    fn into_output(self, stop: TurnStop) -> TurnOutput {
        let tool_calls = self
            .calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let input = if c.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or(json!({}))
                };
                ToolCall { id: c.id, name: c.name, input }
            })
            .collect();
        TurnOutput { text: self.text, tool_calls, stop }
    }

    /// Translate one upstream frame (`None` is the `[DONE]` sentinel) into
    /// zero or more canonical events.
    fn handle(&mut self, frame: Option<&Value>) -> Result<Vec<StreamEvent>, GatewayError> {
        let Some(frame) = frame else {
            self.done = true;
            return Ok(Vec::new());
        };
        if let Some(error) = frame.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown upstream error");
            return Err(GatewayError::ModelUpstream(message.to_string()));
        }

        let mut events = Vec::new();
        let Some(choice) = frame.pointer("/choices/0") else {
            return Ok(events);
        };

        if let Some(delta) = choice.get("delta") {
            if delta.get("role").is_some() && self.text.is_empty() && self.calls.is_empty() {
                events.push(StreamEvent::MessageStart);
            }
            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                if !content.is_empty() {
                    self.text.push_str(content);
                    events.push(StreamEvent::TextDelta(content.to_string()));
                }
            }
            if let Some(thinking) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
                if !thinking.is_empty() {
                    events.push(StreamEvent::ThinkingDelta(thinking.to_string()));
                }
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for fragment in tool_calls {
                    let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let call = self.calls.entry(index).or_default();
                    if let Some(id) = fragment.get("id").and_then(|i| i.as_str()) {
                        call.id = id.to_string();
                    }
                    if let Some(name) = fragment.pointer("/function/name").and_then(|n| n.as_str())
                    {
                        call.name.push_str(name);
                        events.push(StreamEvent::ToolName(call.name.clone()));
                    }
                    if let Some(args) =
                        fragment.pointer("/function/arguments").and_then(|a| a.as_str())
                    {
                        if !args.is_empty() {
                            call.arguments.push_str(args);
                            events.push(StreamEvent::ToolInputDelta(args.to_string()));
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.stop = Some(match reason {
                "tool_calls" => {
                    for _ in 0..self.calls.len() {
                        events.push(StreamEvent::ToolInputEnd);
                    }
                    TurnStop::ToolUse
                }
                "length" => TurnStop::MaxTokens,
                _ => TurnStop::EndTurn,
            });
        }

        Ok(events)
    }
}

fn build_body(req: &TurnRequest<'_>) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if !req.system.is_empty() {
        messages.push(json!({ "role": "system", "content": req.system }));
    }
    for msg in req.messages {
        convert_message(msg, &mut messages);
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.sampling.max_tokens,
        "temperature": req.sampling.temperature,
        "stream": true,
    });
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.prefixed_name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>());
        body["tool_choice"] = json!("auto");
    }
    body
}

/// One internal message can fan out into several wire messages: tool results
/// ride in dedicated `role: "tool"` messages, and an assistant turn that
/// called tools carries a `tool_calls` array.
fn convert_message(msg: &ChatMessage, out: &mut Vec<Value>) {
    let blocks = match &msg.content {
        MessageContent::Text(text) => {
            out.push(json!({ "role": msg.role, "content": text }));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut tool_results: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                parts.push(json!({ "type": "text", "text": text }));
            }
            ContentBlock::ImageUrl { image_url } => {
                parts.push(json!({ "type": "image_url", "image_url": { "url": image_url.url } }));
            }
            ContentBlock::File { file } => {
                parts.push(json!({
                    "type": "text",
                    "text": format!(
                        "[attached file: {}]",
                        file.filename.as_deref().unwrap_or("unnamed")
                    ),
                }));
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                }));
            }
            ContentBlock::ToolResult { tool_use_id, is_error, content } => {
                let text = content
                    .iter()
                    .map(|c| match c {
                        ToolContent::Text { text } => text.clone(),
                        ToolContent::Image { .. } => "[image result]".to_string(),
                        ToolContent::Structured { value } => value.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let text = if *is_error { format!("ERROR: {text}") } else { text };
                tool_results.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": text,
                }));
            }
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        let mut message = json!({ "role": msg.role });
        message["content"] = if parts.is_empty() {
            Value::Null
        } else if parts.len() == 1 && parts[0]["type"] == "text" {
            parts[0]["text"].clone()
        } else {
            json!(parts)
        };
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }
        out.push(message);
    }
    out.extend(tool_results);
}
