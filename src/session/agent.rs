//! One bound (user, model) conversation: server-held history, the tool set
//! aggregated from the user's MCP servers, and the model⇄tool loop behind
//! `converse`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::mcp::{McpSupervisor, ToolDescriptor};
use crate::provider::{self, ProviderConfig, ProviderKind, TurnRequest, TurnStop};
use crate::session::{
    elide_stale_images, redact_stale_tool_text, split_system, ChatMessage, ContentBlock,
};
use crate::stream::{DoneReason, StreamEvent};

#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub enable_thinking: bool,
    pub budget_tokens: u32,
    pub only_n_most_recent_images: Option<usize>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            temperature: 0.5,
            enable_thinking: false,
            budget_tokens: 4096,
            only_n_most_recent_images: None,
        }
    }
}

/// Everything one `/chat/completions` turn hands to the session.
pub struct TurnInput {
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
    pub enabled_server_ids: Vec<String>,
    /// `true`: the session's own history is authoritative and only the
    /// latest user message is appended. `false`: the caller supplied the
    /// full history and the session adopts it.
    pub memory_mode: bool,
    pub max_turns: usize,
}

struct SessionState {
    system: String,
    history: Vec<ChatMessage>,
    tools: Vec<ToolDescriptor>,
    bound_ids: Vec<String>,
}

pub struct AgentSession {
    pub user_id: String,
    pub model_id: String,
    provider_kind: ProviderKind,
    provider_cfg: ProviderConfig,
    http: reqwest::Client,
    supervisor: Arc<McpSupervisor>,
    state: Mutex<SessionState>,
    /// Single-stream slot: held for the whole of one converse call.
    run_lock: Mutex<()>,
    /// (stream id, token) of the in-flight stream, for supersede and stop.
    active: std::sync::Mutex<Option<(String, CancellationToken)>>,
    last_active: std::sync::Mutex<Instant>,
}

impl AgentSession {
    pub fn new(
        user_id: String,
        model_id: String,
        provider_kind: ProviderKind,
        provider_cfg: ProviderConfig,
        http: reqwest::Client,
        supervisor: Arc<McpSupervisor>,
    ) -> Self {
        Self {
            user_id,
            model_id,
            provider_kind,
            provider_cfg,
            http,
            supervisor,
            state: Mutex::new(SessionState {
                system: String::new(),
                history: Vec::new(),
                tools: Vec::new(),
                bound_ids: Vec::new(),
            }),
            run_lock: Mutex::new(()),
            active: std::sync::Mutex::new(None),
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    /// Cancel whatever stream is currently running (eviction, shutdown).
    pub fn cancel_active(&self) {
        if let Some((_, token)) = self.active.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Run one conversational turn, emitting canonical events into `tx`.
    /// Exactly one `Done` event is sent, whatever happens. A concurrent call
    /// supersedes the previous stream: the older token is cancelled and the
    /// newer call waits for the slot.
    pub async fn converse(
        &self,
        stream_id: String,
        input: TurnInput,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        if let Some((old_id, old_token)) =
            self.active.lock().unwrap().replace((stream_id.clone(), cancel.clone()))
        {
            tracing::info!(
                user_id = %self.user_id, model_id = %self.model_id, superseded = %old_id,
                "session: superseding active stream"
            );
            old_token.cancel();
        }

        let _slot = self.run_lock.lock().await;

        let outcome = if cancel.is_cancelled() {
            // Superseded (or stopped) while waiting for the slot.
            Ok(DoneReason::Cancelled)
        } else {
            self.run(&input, &tx, &cancel).await
        };

        match outcome {
            Ok(reason) => {
                let _ = tx.send(StreamEvent::Done { reason }).await;
            }
            Err(GatewayError::Cancelled) => {
                let _ = tx.send(StreamEvent::Done { reason: DoneReason::Cancelled }).await;
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    })
                    .await;
                let _ = tx.send(StreamEvent::Done { reason: DoneReason::Failed }).await;
            }
        }

        self.touch();
        let mut active = self.active.lock().unwrap();
        if active.as_ref().map(|(id, _)| id == &stream_id).unwrap_or(false) {
            *active = None;
        }
    }

    async fn run(
        &self,
        input: &TurnInput,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<DoneReason, GatewayError> {
        let mut sampling = input.sampling.clone();
        if sampling.enable_thinking {
            sampling.max_tokens = sampling.max_tokens.max(sampling.budget_tokens + 1);
        }

        let mut state = self.state.lock().await;

        let (req_system, mut incoming) = split_system(input.messages.clone());
        if input.memory_mode {
            if !req_system.is_empty() {
                state.system = req_system;
            }
            if let Some(latest) = incoming.pop() {
                state.history.push(latest);
            }
        } else {
            state.system = req_system;
            state.history = incoming;
        }

        if state.bound_ids != input.enabled_server_ids {
            state.tools = self
                .supervisor
                .tools_for(&self.user_id, &input.enabled_server_ids)
                .await;
            state.bound_ids = input.enabled_server_ids.clone();
        }

        let mut turns = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            turns += 1;
            if turns > input.max_turns {
                return Err(GatewayError::ModelUpstream(format!(
                    "turn limit of {} reached without a final answer",
                    input.max_turns
                )));
            }

            if let Some(keep) = sampling.only_n_most_recent_images {
                elide_stale_images(&mut state.history, keep);
            }
            redact_stale_tool_text(&mut state.history);

            let output = provider::stream_turn(
                &self.http,
                self.provider_kind,
                &self.provider_cfg,
                TurnRequest {
                    model: &self.model_id,
                    system: &state.system,
                    messages: &state.history,
                    tools: &state.tools,
                    sampling: &sampling,
                },
                tx,
                cancel,
            )
            .await?;

            match output.stop {
                TurnStop::Cancelled => return Err(GatewayError::Cancelled),
                TurnStop::ToolUse if !output.tool_calls.is_empty() => {
                    let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
                    if !output.text.is_empty() {
                        assistant_blocks.push(ContentBlock::Text { text: output.text.clone() });
                    }
                    for call in &output.tool_calls {
                        assistant_blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                        });
                    }

                    let mut result_blocks: Vec<ContentBlock> = Vec::new();
                    for call in output.tool_calls {
                        if cancel.is_cancelled() {
                            return Err(GatewayError::Cancelled);
                        }
                        let result = self
                            .supervisor
                            .call_tool(
                                &self.user_id,
                                &input.enabled_server_ids,
                                &call.name,
                                call.input,
                            )
                            .await;
                        if tx.send(StreamEvent::ToolResult(result.clone())).await.is_err() {
                            return Err(GatewayError::Cancelled);
                        }
                        result_blocks.push(ContentBlock::ToolResult {
                            tool_use_id: call.id,
                            is_error: result.is_error,
                            content: result.content,
                        });
                    }

                    // Commit the tool_use message and its results together,
                    // only once every call has completed. A turn cancelled
                    // mid-dispatch must leave no dangling tool_use in the
                    // session history: both providers reject a tool_use
                    // block without its matching tool_result on the next
                    // request.
                    state.history.push(ChatMessage::blocks("assistant", assistant_blocks));
                    state.history.push(ChatMessage::blocks("user", result_blocks));
                    // Loop back with the tool results in context.
                }
                TurnStop::MaxTokens => {
                    if !output.text.is_empty() {
                        state.history.push(ChatMessage::text("assistant", output.text));
                    }
                    return Ok(DoneReason::MaxTokens);
                }
                _ => {
                    if !output.text.is_empty() {
                        state.history.push(ChatMessage::text("assistant", output.text));
                    }
                    return Ok(DoneReason::Complete);
                }
            }
        }
    }

    /// Number of messages currently held for this session.
    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }
}
