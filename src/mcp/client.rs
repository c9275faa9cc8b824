//! One live connection to one MCP server: the child process, its stdio
//! pipes, and the JSON-RPC 2.0 request/response plumbing over them.
//!
//! Writes go through a single FIFO queue so concurrent tool calls from
//! unrelated sessions can never interleave partial messages on the
//! subprocess's stdin. Responses are matched back to callers by request id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::error::GatewayError;
use crate::mcp::{ServerSpec, ServerStatus, ToolContent, ToolDescriptor, TOOL_PREFIX_SEP};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Consecutive transport failures tolerated before the client is declared
/// failed and becomes eligible for teardown by the supervisor.
const TRANSPORT_FAILURE_BUDGET: u32 = 2;

/// Environment variables forwarded from the gateway process to subprocesses.
/// Everything else the child sees comes from the validated spec.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Starting,
    Ready,
    Closing,
    Failed,
    Closed,
}

enum WriterCmd {
    Line(String),
    Shutdown,
}

#[derive(Debug)]
pub struct McpClient {
    pub server_id: String,
    pub server_name: String,
    state: RwLock<ClientState>,
    tools: RwLock<Vec<ToolDescriptor>>,
    writer_tx: mpsc::Sender<WriterCmd>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: AtomicU64,
    transport_failures: AtomicU32,
    child: tokio::sync::Mutex<Option<Child>>,
    call_timeout: Duration,
}

impl McpClient {
    /// Spawn the subprocess described by `spec` and complete the MCP
    /// handshake (`initialize` → `notifications/initialized` → `tools/list`)
    /// within `handshake_timeout`. The spec must already be validated and
    /// persisted by the caller.
    pub async fn connect(
        spec: &ServerSpec,
        scratch_dir: &Path,
        handshake_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Arc<Self>, GatewayError> {
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|e| GatewayError::McpSpawnFailed(format!("scratch dir: {e}")))?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter())
            .current_dir(scratch_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for key in INHERITED_ENV {
            if let Ok(v) = std::env::var(key) {
                cmd.env(key, v);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::McpSpawnFailed(format!("{}: {e}", spec.command)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::McpSpawnFailed("child stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::McpSpawnFailed("child stdout not captured".to_string())
        })?;
        let stderr = child.stderr.take();

        let (writer_tx, writer_rx) = mpsc::channel::<WriterCmd>(64);
        let client = Arc::new(Self {
            server_id: spec.server_id.clone(),
            server_name: if spec.server_name.is_empty() {
                spec.server_id.clone()
            } else {
                spec.server_name.clone()
            },
            state: RwLock::new(ClientState::Starting),
            tools: RwLock::new(Vec::new()),
            writer_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            transport_failures: AtomicU32::new(0),
            child: tokio::sync::Mutex::new(Some(child)),
            call_timeout,
        });

        client.spawn_writer(stdin, writer_rx);
        Self::spawn_reader(Arc::clone(&client), stdout);
        if let Some(stderr) = stderr {
            client.spawn_stderr_drain(stderr);
        }

        match tokio::time::timeout(handshake_timeout, client.handshake()).await {
            Ok(Ok(())) => {
                client.set_state(ClientState::Ready);
                tracing::info!(
                    server_id = %client.server_id,
                    tools = client.tools().len(),
                    "mcp: server ready"
                );
                Ok(client)
            }
            Ok(Err(e)) => {
                client.kill().await;
                Err(e)
            }
            Err(_) => {
                client.kill().await;
                Err(GatewayError::McpHandshakeTimeout(handshake_timeout.as_secs()))
            }
        }
    }

    async fn handshake(&self) -> Result<(), GatewayError> {
        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "clientInfo": { "name": "agentgate", "version": env!("CARGO_PKG_VERSION") },
                }),
                self.call_timeout,
            )
            .await?;
        if init.get("error").is_some() {
            return Err(GatewayError::McpSpawnFailed(format!(
                "initialize rejected: {}",
                init["error"]["message"].as_str().unwrap_or("unknown")
            )));
        }

        self.notify("notifications/initialized", json!({})).await?;
        self.refresh_tools().await?;
        Ok(())
    }

    /// Fetch `tools/list` and replace the cached descriptors.
    async fn refresh_tools(&self) -> Result<(), GatewayError> {
        let reply = self.request("tools/list", json!({}), self.call_timeout).await?;
        let raw = reply
            .pointer("/result/tools")
            .and_then(|t| t.as_array())
            .ok_or_else(|| GatewayError::McpTransport("malformed tools/list reply".into()))?;

        let tools: Vec<ToolDescriptor> = raw
            .iter()
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?.to_string();
                Some(ToolDescriptor {
                    prefixed_name: format!("{}{}{}", self.server_id, TOOL_PREFIX_SEP, name),
                    name,
                    server_id: self.server_id.clone(),
                    description: t.get("description").and_then(|d| d.as_str()).map(String::from),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                })
            })
            .collect();

        *self.tools.write().unwrap() = tools;
        Ok(())
    }

    /// Cached tool descriptors; populated by the handshake, invalidated only
    /// by reconnect.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap().clone()
    }

    pub fn state(&self) -> ClientState {
        *self.state.read().unwrap()
    }

    pub fn status(&self) -> ServerStatus {
        match self.state() {
            ClientState::Init => ServerStatus::Registered,
            ClientState::Starting => ServerStatus::Connecting,
            ClientState::Ready | ClientState::Closing => ServerStatus::Ready,
            ClientState::Failed | ClientState::Closed => ServerStatus::Failed,
        }
    }

    fn set_state(&self, next: ClientState) {
        *self.state.write().unwrap() = next;
    }

    /// Invoke a tool by its original (unprefixed) name. Bounded by the
    /// per-call timeout; tool-level failures come back as
    /// `Err(McpToolRaised)`, which the session converts into an error-flagged
    /// result block rather than aborting the turn.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<(bool, Vec<ToolContent>), GatewayError> {
        if self.state() != ClientState::Ready {
            return Err(GatewayError::McpTransport(format!(
                "server '{}' is not ready",
                self.server_id
            )));
        }

        let reply = self
            .request(
                "tools/call",
                json!({ "name": tool_name, "arguments": arguments }),
                self.call_timeout,
            )
            .await?;

        if let Some(error) = reply.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown MCP error")
                .to_string();
            return Err(GatewayError::McpToolRaised(message));
        }

        let is_error = reply
            .pointer("/result/isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let content = reply
            .pointer("/result/content")
            .and_then(|c| c.as_array())
            .map(|arr| arr.iter().map(ToolContent::from_mcp_value).collect())
            .unwrap_or_default();
        Ok((is_error, content))
    }

    /// Graceful teardown: stop accepting writes, close stdin, give the child
    /// a drain window, then kill. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().unwrap();
            if matches!(*state, ClientState::Closing | ClientState::Closed) {
                return;
            }
            *state = ClientState::Closing;
        }
        let _ = self.writer_tx.send(WriterCmd::Shutdown).await;

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(DRAIN_WINDOW, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server_id = %self.server_id, %status, "mcp: child exited");
                }
                _ => {
                    tracing::warn!(server_id = %self.server_id, "mcp: drain window expired, killing");
                    let _ = child.kill().await;
                }
            }
        }
        *guard = None;
        self.set_state(ClientState::Closed);
    }

    async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
        }
        self.set_state(ClientState::Closed);
    }

    // ── JSON-RPC plumbing ───────────────────────────────────────────────

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .map_err(|e| GatewayError::McpTransport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if self.writer_tx.send(WriterCmd::Line(line)).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(self.transport_error("write channel closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                self.transport_failures.store(0, Ordering::Relaxed);
                Ok(reply)
            }
            Ok(Err(_)) => {
                // Reader dropped the sender: pipe closed underneath us.
                Err(self.transport_error("connection closed"))
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                if method == "tools/call" {
                    Err(GatewayError::McpToolTimeout)
                } else {
                    Err(self.transport_error("request timed out"))
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), GatewayError> {
        let line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .map_err(|e| GatewayError::McpTransport(e.to_string()))?;
        self.writer_tx
            .send(WriterCmd::Line(line))
            .await
            .map_err(|_| self.transport_error("write channel closed"))
    }

    fn transport_error(&self, reason: &str) -> GatewayError {
        let failures = self.transport_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= TRANSPORT_FAILURE_BUDGET && self.state() == ClientState::Ready {
            tracing::warn!(
                server_id = %self.server_id,
                failures,
                "mcp: transport failure budget exhausted, marking failed"
            );
            self.set_state(ClientState::Failed);
        }
        GatewayError::McpTransport(format!("{}: {reason}", self.server_id))
    }

    fn spawn_writer(
        &self,
        mut stdin: tokio::process::ChildStdin,
        mut rx: mpsc::Receiver<WriterCmd>,
    ) {
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriterCmd::Line(line) => {
                        if stdin.write_all(line.as_bytes()).await.is_err()
                            || stdin.write_all(b"\n").await.is_err()
                            || stdin.flush().await.is_err()
                        {
                            tracing::warn!(%server_id, "mcp: stdin write failed");
                            break;
                        }
                    }
                    WriterCmd::Shutdown => break,
                }
            }
            // Dropping stdin signals EOF to the child.
        });
    }

    fn spawn_reader(client: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let pending = Arc::clone(&client.pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let value: Value = match serde_json::from_str(line) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::debug!(server_id = %client.server_id, error = %e, "mcp: non-JSON line on stdout");
                                continue;
                            }
                        };
                        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending.lock().unwrap().remove(&id) {
                                let _ = tx.send(value);
                            }
                        } else if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                            tracing::debug!(server_id = %client.server_id, method, "mcp: notification");
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // EOF: drop all waiters so their oneshots resolve to errors.
            pending.lock().unwrap().clear();
            let state = client.state();
            if matches!(state, ClientState::Starting | ClientState::Ready) {
                tracing::warn!(server_id = %client.server_id, "mcp: stdout closed unexpectedly");
                client.set_state(ClientState::Failed);
            }
        });
    }

    fn spawn_stderr_drain(&self, stderr: tokio::process::ChildStderr) {
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(%server_id, "mcp stderr: {line}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(command: &str, args: &[&str]) -> ServerSpec {
        ServerSpec {
            server_id: "echo".into(),
            server_name: "echo".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn connect_fails_fast_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("definitely-not-a-real-binary-7f3a", &["x"]);
        let err = McpClient::connect(
            &spec,
            dir.path(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "mcp:spawn-failed");
    }

    #[tokio::test]
    async fn handshake_times_out_for_silent_child() {
        // `sleep` never speaks JSON-RPC, so the handshake deadline must fire.
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("sleep", &["30"]);
        let err = McpClient::connect(
            &spec,
            dir.path(),
            Duration::from_millis(300),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "mcp:handshake-timeout");
    }

}
