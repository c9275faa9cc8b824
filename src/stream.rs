//! Canonical stream events and the provider-shaped wire envelope.
//!
//! Everything the agent loop produces is one of the `StreamEvent` variants
//! below. On the wire each event becomes a `chat.completion.chunk` frame
//! (`data: <json>\n\n`), chosen for compatibility with the existing browser
//! client; the terminal frame is `data: [DONE]`.

use std::convert::Infallible;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::mcp::ToolCallResult;

/// How often an SSE comment frame is emitted to keep intermediaries from
/// closing an idle connection mid-tool-call.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart,
    TextDelta(String),
    ThinkingDelta(String),
    /// Emitted once per tool call, before any of its input streams.
    ToolName(String),
    ToolInputDelta(String),
    /// Distinguished end marker for one tool call's input stream.
    ToolInputEnd,
    ToolResult(ToolCallResult),
    /// Non-fatal unless followed by `Done { Failed }`.
    Error { kind: String, message: String },
    Done { reason: DoneReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Complete,
    MaxTokens,
    Cancelled,
    Failed,
}

impl DoneReason {
    pub fn finish_reason(self) -> &'static str {
        match self {
            DoneReason::Complete => "stop",
            DoneReason::MaxTokens => "max_tokens",
            DoneReason::Cancelled => "stop_requested",
            DoneReason::Failed => "error",
        }
    }
}

fn now_parts() -> (u128, u64) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_nanos(), now.as_secs())
}

fn chunk(model: &str, id_prefix: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    let (nanos, secs) = now_parts();
    json!({
        "id": format!("{id_prefix}{nanos}"),
        "object": "chat.completion.chunk",
        "created": secs,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }]
    })
}

/// Map one canonical event onto its wire frame. `Done` frames carry only the
/// finish reason; the `[DONE]` sentinel is appended by the transport layer.
pub fn envelope(model: &str, event: &StreamEvent) -> Value {
    match event {
        StreamEvent::MessageStart => chunk(model, "chat", json!({ "role": "assistant" }), None),
        StreamEvent::TextDelta(text) => chunk(model, "chat", json!({ "content": text }), None),
        StreamEvent::ThinkingDelta(text) => chunk(model, "chat", json!({ "thinking": text }), None),
        StreamEvent::ToolName(name) => chunk(model, "chat", json!({ "tool_name": name }), None),
        StreamEvent::ToolInputDelta(fragment) => {
            chunk(model, "chat", json!({ "tool_input": fragment }), None)
        }
        StreamEvent::ToolInputEnd => {
            chunk(model, "chat", json!({ "tool_input_end": true }), None)
        }
        StreamEvent::ToolResult(result) => {
            let serialized =
                serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string());
            let mut frame = chunk(model, "chat", json!({}), Some("tool_use"));
            frame["choices"][0]["message_extras"] = json!({ "tool_use": serialized });
            frame
        }
        StreamEvent::Error { kind, message } => chunk(
            model,
            "error",
            json!({ "content": format!("Error: [{kind}] {message}") }),
            Some("error"),
        ),
        StreamEvent::Done { reason } => {
            let delta = if *reason == DoneReason::MaxTokens {
                json!({ "content": "<max output token reached>" })
            } else {
                json!({})
            };
            chunk(model, "stop", delta, Some(reason.finish_reason()))
        }
    }
}

/// Build the streaming HTTP response: `X-Stream-ID` header first, then one
/// SSE frame per canonical event, comment heartbeats while idle, and a
/// terminal `data: [DONE]`.
pub fn sse_response(
    model: String,
    stream_id: String,
    mut events: mpsc::Receiver<StreamEvent>,
) -> Response {
    let (frame_tx, frame_rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let done = matches!(event, StreamEvent::Done { .. });
            let frame = Event::default().data(envelope(&model, &event).to_string());
            if frame_tx.send(Ok(frame)).await.is_err() {
                break; // client went away; the agent loop sees the closed channel
            }
            if done {
                let _ = frame_tx.send(Ok(Event::default().data("[DONE]"))).await;
                break;
            }
        }
    });

    let mut response = Sse::new(ReceiverStream::new(frame_rx))
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
        .into_response();
    if let Ok(value) = stream_id.parse() {
        response.headers_mut().insert("x-stream-id", value);
    }
    response
}

/// Drain a finished event stream into a single non-streaming completion
/// body. Tool results are surfaced through `message_extras` exactly as the
/// streaming envelope does.
pub async fn aggregate_response(
    model: &str,
    mut events: mpsc::Receiver<StreamEvent>,
) -> Value {
    let mut content = String::new();
    let mut tool_results: Vec<ToolCallResult> = Vec::new();
    let mut reason = DoneReason::Complete;
    let mut error: Option<String> = None;

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::TextDelta(text) => content.push_str(&text),
            StreamEvent::ToolResult(result) => tool_results.push(result),
            StreamEvent::Error { kind, message } => {
                error = Some(format!("[{kind}] {message}"));
            }
            StreamEvent::Done { reason: r } => {
                reason = r;
                break;
            }
            _ => {}
        }
    }

    let (nanos, secs) = now_parts();
    let mut message = json!({ "role": "assistant", "content": content });
    if let Some(error) = error {
        message["content"] = json!(format!("Error: {error}"));
    }
    let mut choice = json!({
        "index": 0,
        "message": message,
        "finish_reason": reason.finish_reason(),
    });
    if !tool_results.is_empty() {
        choice["message_extras"] = json!({
            "tool_use": serde_json::to_string(&tool_results).unwrap_or_else(|_| "[]".into()),
        });
    }
    json!({
        "id": format!("chat{nanos}"),
        "object": "chat.completion",
        "created": secs,
        "model": model,
        "choices": [choice],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
    })
}
