//! HTTP handlers for the `/v1` surface plus health probes.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::auth::UserId;
use crate::error::GatewayError;
use crate::mcp::ServerSpec;
use crate::session::{AgentSession, ChatMessage, SamplingParams, TurnInput};
use crate::state::AppState;
use crate::stream::{aggregate_response, sse_response, StreamEvent};

/// Channel depth between the agent loop and the SSE writer; deltas beyond
/// this apply backpressure to the upstream read.
const EVENT_CHANNEL_DEPTH: usize = 256;

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Load-balancer variant with explicit no-cache headers.
pub async fn health_detailed(State(state): State<AppState>) -> Response {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let body = json!({
        "status": "healthy",
        "service": "agentgate-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "active_streams": state.sessions.active_stream_count(),
        "timestamp": now,
    });
    (
        [
            ("cache-control", "no-cache, no-store, must-revalidate"),
            ("pragma", "no-cache"),
            ("expires", "0"),
        ],
        Json(body),
    )
        .into_response()
}

// ── Model catalog ───────────────────────────────────────────────────────

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .config
        .models
        .iter()
        .map(|m| json!({ "model_id": m.model_id, "model_name": m.model_name }))
        .collect();
    Json(json!({ "models": models }))
}

// ── MCP server management ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AddMcpServerRequest {
    #[serde(default)]
    pub server_id: String,
    #[serde(default, alias = "server_desc")]
    pub server_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Alternative nested form: `{"mcpServers": {"<id>": {"command": ...}}}`
    /// as pasted from MCP documentation. Normalized into the flat fields.
    #[serde(default)]
    pub config_json: Option<Value>,
}

impl AddMcpServerRequest {
    /// Collapse the two accepted shapes into one ServerSpec. `command` is
    /// required after normalization; a spec without one is rejected at
    /// validation.
    fn normalize(self) -> ServerSpec {
        if let Some(config) = &self.config_json {
            let servers = config.get("mcpServers").unwrap_or(config);
            if let Some((server_id, entry)) = servers.as_object().and_then(|o| o.iter().next()) {
                let str_vec = |v: &Value| -> Vec<String> {
                    v.as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|x| x.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                let str_map = |v: &Value| -> HashMap<String, String> {
                    v.as_object()
                        .map(|o| {
                            o.iter()
                                .filter_map(|(k, x)| {
                                    x.as_str().map(|s| (k.clone(), s.to_string()))
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                };
                return ServerSpec {
                    server_id: server_id.clone(),
                    server_name: if self.server_name.is_empty() {
                        server_id.clone()
                    } else {
                        self.server_name
                    },
                    command: entry
                        .get("command")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    args: entry.get("args").map(&str_vec).unwrap_or_default(),
                    env: entry.get("env").map(&str_map).unwrap_or_default(),
                };
            }
        }
        ServerSpec {
            server_name: if self.server_name.is_empty() {
                self.server_id.clone()
            } else {
                self.server_name
            },
            server_id: self.server_id,
            command: self.command.unwrap_or_default(),
            args: self.args,
            env: self.env,
        }
    }
}

pub async fn add_mcp_server(
    State(state): State<AppState>,
    user: UserId,
    Json(body): Json<AddMcpServerRequest>,
) -> Result<Json<Value>, GatewayError> {
    let spec = body.normalize();
    let server_id = spec.server_id.clone();
    let status = state.supervisor.add(user.as_str(), spec).await?;
    Ok(Json(json!({ "server_id": server_id, "status": status })))
}

pub async fn remove_mcp_server(
    State(state): State<AppState>,
    user: UserId,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    state.supervisor.remove(user.as_str(), &server_id).await?;
    Ok(Json(json!({ "server_id": server_id, "removed": true })))
}

pub async fn list_mcp_server(
    State(state): State<AppState>,
    user: UserId,
) -> Result<Json<Value>, GatewayError> {
    let servers = state.supervisor.list(user.as_str()).await?;
    Ok(Json(json!({ "servers": servers })))
}

// ── Chat ────────────────────────────────────────────────────────────────

fn default_max_tokens() -> u32 {
    4000
}
fn default_temperature() -> f32 {
    0.5
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtraParams {
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default)]
    pub budget_tokens: Option<u32>,
    #[serde(default)]
    pub only_n_most_recent_images: Option<usize>,
    #[serde(default)]
    pub use_swarm: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
    /// Memory mode: `true` means the server's history is authoritative.
    #[serde(default, alias = "use_memory")]
    pub keep_session: bool,
    #[serde(default)]
    pub extra_params: ExtraParams,
}

pub async fn chat_completions(
    State(state): State<AppState>,
    user: UserId,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    if body.extra_params.use_swarm {
        return Err(GatewayError::SwarmReserved);
    }

    // Session-restore probe from the UI: an empty message list just checks
    // that the session machinery is reachable. It answers before any model
    // validation so a stale model id cannot break restore.
    if body.messages.is_empty() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        return Ok(Json(json!({
            "id": format!("chat{}", now.as_nanos()),
            "object": "chat.completion",
            "created": now.as_secs(),
            "model": body.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "" },
                "finish_reason": "load",
            }],
            "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
        }))
        .into_response());
    }

    let (provider_kind, provider_cfg) = state.provider_for(&body.model)?;
    state.supervisor.startup_reconcile(user.as_str()).await;

    let model_id = body.model.clone();
    let session = state
        .sessions
        .get_or_create(user.as_str(), &model_id, || {
            AgentSession::new(
                user.as_str().to_string(),
                model_id.clone(),
                provider_kind,
                provider_cfg.clone(),
                state.client.clone(),
                state.supervisor.clone(),
            )
        })
        .await;

    let sampling = SamplingParams {
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        enable_thinking: body.extra_params.enable_thinking,
        budget_tokens: body.extra_params.budget_tokens.unwrap_or(4096),
        only_n_most_recent_images: body.extra_params.only_n_most_recent_images,
    };
    let input = TurnInput {
        messages: body.messages,
        sampling,
        enabled_server_ids: body.mcp_server_ids,
        memory_mode: body.keep_session,
        max_turns: state.config.max_turns,
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let stream_id = format!("stream_{}_{}", user.as_str(), now.as_nanos());
    let cancel = state.sessions.register_stream(&stream_id, user.as_str());

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_DEPTH);
    {
        let sessions = state.sessions.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            session.converse(stream_id.clone(), input, tx, cancel).await;
            sessions.unregister_stream(&stream_id);
        });
    }

    if body.stream {
        Ok(sse_response(body.model, stream_id, rx))
    } else {
        Ok(Json(aggregate_response(&body.model, rx).await).into_response())
    }
}

// ── Stream stop / history ───────────────────────────────────────────────

pub async fn stop_stream(
    State(state): State<AppState>,
    user: UserId,
    Path(stream_id): Path<String>,
) -> Response {
    let authorized = state.sessions.cancel_stream(&stream_id, Some(user.as_str()));
    if !authorized {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": { "kind": "auth:bad-token", "message": "not your stream" } })),
        )
            .into_response();
    }
    // Idempotent success, including for unknown or completed streams.
    (
        [("cache-control", "no-cache, no-store, must-revalidate")],
        Json(json!({ "stream_id": stream_id, "stopping": true })),
    )
        .into_response()
}

pub async fn remove_history(State(state): State<AppState>, user: UserId) -> Json<Value> {
    state.sessions.remove_user_sessions(user.as_str()).await;
    Json(json!({ "removed": true }))
}
