//! Upstream model providers and the adapter that turns their wire formats
//! into canonical stream events.
//!
//! Provider A (`anthropic`) emits discrete content-block start/stop frames
//! with structured tool-use blocks; provider B (`openai`) emits incremental
//! JSON deltas. Both adapters forward tokens as received and buffer only at
//! event boundaries.

mod anthropic;
mod openai;

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::mcp::ToolDescriptor;
use crate::session::{ChatMessage, SamplingParams};
use crate::stream::StreamEvent;

/// Total wall-clock budget for one upstream call, including the streamed
/// body. Deliberately much longer than any tool-call deadline.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_JITTER_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "openai" | "openai-compatible" => Some(ProviderKind::Openai),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
}

/// One request the session loop makes against the upstream model.
pub struct TurnRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolDescriptor],
    pub sampling: &'a SamplingParams,
}

/// A complete tool invocation the model asked for, with its accumulated
/// input parsed back into JSON.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStop {
    EndTurn,
    ToolUse,
    MaxTokens,
    Cancelled,
}

/// What one upstream call produced: the assistant text, any tool calls, and
/// why the stream stopped.
#[derive(Debug)]
pub struct TurnOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop: TurnStop,
}

/// Run one streamed model turn, forwarding canonical events to `tx` as they
/// arrive. Cancellation is observed between frames.
pub async fn stream_turn(
    client: &reqwest::Client,
    kind: ProviderKind,
    cfg: &ProviderConfig,
    req: TurnRequest<'_>,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<TurnOutput, GatewayError> {
    match kind {
        ProviderKind::Anthropic => anthropic::stream_turn(client, cfg, req, tx, cancel).await,
        ProviderKind::Openai => openai::stream_turn(client, cfg, req, tx, cancel).await,
    }
}

/// Whether an outcome is a transient failure worth retrying.
fn is_retryable(result: &Result<reqwest::Response, reqwest::Error>) -> bool {
    match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            status == 429 || status == 503 || status == 529
        }
        Err(e) => e.is_timeout() || e.is_connect(),
    }
}

/// Send an upstream request with retry + exponential backoff on transient
/// failures. Returns the successful response or a `model:upstream` error
/// after the budget is exhausted.
pub(crate) async fn send_with_retry(
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response, GatewayError> {
    let mut last_err = String::new();

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
            let jitter =
                Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS));
            tracing::warn!(attempt, "upstream retry after {:?}", backoff + jitter);
            tokio::time::sleep(backoff + jitter).await;
        }

        let result = build().timeout(UPSTREAM_TIMEOUT).send().await;

        if !is_retryable(&result) {
            return match result {
                Ok(resp) if resp.status().is_success() => Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let snippet: String = body.chars().take(500).collect();
                    Err(GatewayError::ModelUpstream(format!("HTTP {status}: {snippet}")))
                }
                Err(e) => Err(GatewayError::ModelUpstream(e.to_string())),
            };
        }

        last_err = match &result {
            Ok(resp) => format!("HTTP {}", resp.status()),
            Err(e) => e.to_string(),
        };
    }

    Err(GatewayError::ModelUpstream(format!(
        "failed after {} attempts, last error: {last_err}",
        MAX_RETRIES + 1
    )))
}

/// Incremental SSE frame parser shared by both providers: buffers until a
/// blank line, strips `data: ` prefixes, and yields parsed JSON payloads.
/// The `[DONE]` sentinel is surfaced as `None` inside the batch.
pub(crate) struct SseFrameParser {
    buffer: String,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<Option<Value>> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            Self::parse_block(&block, &mut out);
        }
        out
    }

    pub fn flush(&mut self) -> Vec<Option<Value>> {
        let block = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        Self::parse_block(&block, &mut out);
        out
    }

    fn parse_block(block: &str, out: &mut Vec<Option<Value>>) {
        for line in block.lines() {
            let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                out.push(None);
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(data) {
                out.push(Some(v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parser_yields_frames_split_across_chunks() {
        let mut parser = SseFrameParser::new();
        assert!(parser.feed("data: {\"a\":").is_empty());
        let frames = parser.feed("1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Some(json!({"a": 1})));
        assert_eq!(frames[1], Some(json!({"b": 2})));
    }

    #[test]
    fn parser_handles_event_lines_and_done_sentinel() {
        let mut parser = SseFrameParser::new();
        let frames =
            parser.feed("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_some());
        assert!(frames[1].is_none());
    }

    #[test]
    fn parser_flush_drains_trailing_partial_block() {
        let mut parser = SseFrameParser::new();
        assert!(parser.feed("data: {\"x\":true}\n").is_empty());
        let frames = parser.flush();
        assert_eq!(frames, vec![Some(json!({"x": true}))]);
    }

    #[test]
    fn parser_tolerates_no_space_after_colon() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed("data:{\"y\":0}\n\n");
        assert_eq!(frames, vec![Some(json!({"y": 0}))]);
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!(ProviderKind::parse("Anthropic"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::Openai));
        assert_eq!(ProviderKind::parse("bedrock"), None);
    }
}
