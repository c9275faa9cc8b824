//! Per-user MCP client registries. The supervisor owns every live
//! subprocess client, keyed by user, and is the only component that mutates
//! the config store. Mutations are serialized per user; nothing here takes a
//! lock across users.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::GatewayError;
use crate::mcp::{
    McpClient, ServerSpec, ServerStatus, ToolCallResult, ToolDescriptor, TOOL_PREFIX_SEP,
};
use crate::store::ConfigStore;
use crate::validate;

pub struct McpSupervisor {
    users: RwLock<HashMap<String, Arc<UserRegistry>>>,
    store: ConfigStore,
    /// Read-only server specs from the gateway config, visible to every
    /// user. Never persisted per user, never removable per user.
    shared_specs: Vec<ServerSpec>,
    scratch_root: PathBuf,
    handshake_timeout: Duration,
    call_timeout: Duration,
}

struct UserRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<String, Arc<McpClient>>,
    /// Server ids whose last spawn attempt failed (set during reconcile so
    /// `list` can report them as failed rather than merely registered).
    failed: HashSet<String>,
    reconciled: bool,
}

/// One row of the per-user server listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerListEntry {
    pub server_id: String,
    pub server_name: String,
    pub status: ServerStatus,
    pub shared: bool,
}

impl McpSupervisor {
    pub fn new(
        store: ConfigStore,
        shared_specs: Vec<ServerSpec>,
        scratch_root: PathBuf,
        handshake_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            store,
            shared_specs,
            scratch_root,
            handshake_timeout,
            call_timeout,
        }
    }

    async fn registry(&self, user_id: &str) -> Arc<UserRegistry> {
        if let Some(reg) = self.users.read().await.get(user_id) {
            return Arc::clone(reg);
        }
        let mut users = self.users.write().await;
        Arc::clone(users.entry(user_id.to_string()).or_insert_with(|| {
            Arc::new(UserRegistry {
                inner: Mutex::new(RegistryInner::default()),
            })
        }))
    }

    fn scratch_dir(&self, user_id: &str) -> PathBuf {
        self.scratch_root.join(sanitize_for_path(user_id))
    }

    /// On the first touch of a user after process start, re-spawn clients
    /// for every persisted spec (plus the shared ones). Individual failures
    /// are recorded and logged, never propagated: one broken server must not
    /// take the rest of the user's tools down with it.
    pub async fn startup_reconcile(&self, user_id: &str) {
        let registry = self.registry(user_id).await;
        let mut inner = registry.inner.lock().await;
        if inner.reconciled {
            return;
        }
        inner.reconciled = true;

        let mut specs = match self.store.list(user_id).await {
            Ok(specs) => specs,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "mcp: reconcile could not read store");
                Vec::new()
            }
        };
        specs.extend(self.shared_specs.iter().cloned());

        for spec in specs {
            if inner.clients.contains_key(&spec.server_id) {
                continue;
            }
            match McpClient::connect(
                &spec,
                &self.scratch_dir(user_id),
                self.handshake_timeout,
                self.call_timeout,
            )
            .await
            {
                Ok(client) => {
                    inner.failed.remove(&spec.server_id);
                    inner.clients.insert(spec.server_id.clone(), client);
                }
                Err(e) => {
                    tracing::warn!(user_id, server_id = %spec.server_id, error = %e,
                        "mcp: reconcile spawn failed");
                    inner.failed.insert(spec.server_id.clone());
                }
            }
        }
    }

    /// Register and start a server for one user: validate → persist → spawn.
    /// A spawn or handshake failure rolls the persisted row back so a crash
    /// can never leave a spec without a supervising process, nor an orphan
    /// process without a spec. Re-adding an existing id replaces it.
    pub async fn add(&self, user_id: &str, spec: ServerSpec) -> Result<ServerStatus, GatewayError> {
        validate::validate_spec(&spec)?;
        if self.shared_specs.iter().any(|s| s.server_id == spec.server_id) {
            return Err(GatewayError::ServerExists(spec.server_id));
        }

        self.startup_reconcile(user_id).await;
        let registry = self.registry(user_id).await;
        let mut inner = registry.inner.lock().await;

        let previous = self.store.get(user_id, &spec.server_id).await?;
        self.store.put(user_id, &spec).await?;

        if let Some(old) = inner.clients.remove(&spec.server_id) {
            old.shutdown().await;
        }

        match McpClient::connect(
            &spec,
            &self.scratch_dir(user_id),
            self.handshake_timeout,
            self.call_timeout,
        )
        .await
        {
            Ok(client) => {
                let status = client.status();
                inner.failed.remove(&spec.server_id);
                inner.clients.insert(spec.server_id.clone(), client);
                tracing::info!(user_id, server_id = %spec.server_id, "mcp: server added");
                Ok(status)
            }
            Err(e) => {
                // Roll the persisted write back to the pre-add state.
                let rollback = match previous {
                    Some(prev) => self.store.put(user_id, &prev).await,
                    None => self.store.delete(user_id, &spec.server_id).await,
                };
                if let Err(rb) = rollback {
                    tracing::error!(user_id, server_id = %spec.server_id, error = %rb,
                        "mcp: rollback after spawn failure also failed");
                }
                Err(e)
            }
        }
    }

    /// Stop and unregister. Close errors are logged but never block the
    /// delete; removing an unknown or already-removed id succeeds.
    pub async fn remove(&self, user_id: &str, server_id: &str) -> Result<(), GatewayError> {
        if self.shared_specs.iter().any(|s| s.server_id == server_id) {
            tracing::debug!(user_id, server_id, "mcp: remove of shared server ignored");
            return Ok(());
        }

        self.startup_reconcile(user_id).await;
        let registry = self.registry(user_id).await;
        let mut inner = registry.inner.lock().await;

        if let Some(client) = inner.clients.remove(server_id) {
            client.shutdown().await;
        }
        inner.failed.remove(server_id);
        self.store.delete(user_id, server_id).await?;
        tracing::info!(user_id, server_id, "mcp: server removed");
        Ok(())
    }

    /// Union of persisted specs and live clients, annotated with status.
    /// A store outage degrades to the in-memory view instead of failing.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ServerListEntry>, GatewayError> {
        self.startup_reconcile(user_id).await;
        let registry = self.registry(user_id).await;
        let inner = registry.inner.lock().await;

        let persisted = match self.store.list(user_id).await {
            Ok(specs) => specs,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "mcp: list falling back to live clients");
                Vec::new()
            }
        };

        let mut entries: Vec<ServerListEntry> = Vec::new();
        for spec in persisted.iter().chain(self.shared_specs.iter()) {
            if entries.iter().any(|e| e.server_id == spec.server_id) {
                continue;
            }
            let status = match inner.clients.get(&spec.server_id) {
                Some(client) => client.status(),
                None if inner.failed.contains(&spec.server_id) => ServerStatus::Failed,
                None => ServerStatus::Registered,
            };
            entries.push(ServerListEntry {
                server_id: spec.server_id.clone(),
                server_name: if spec.server_name.is_empty() {
                    spec.server_id.clone()
                } else {
                    spec.server_name.clone()
                },
                status,
                shared: self.shared_specs.iter().any(|s| s.server_id == spec.server_id),
            });
        }
        for (server_id, client) in inner.clients.iter() {
            if !entries.iter().any(|e| &e.server_id == server_id) {
                entries.push(ServerListEntry {
                    server_id: server_id.clone(),
                    server_name: client.server_name.clone(),
                    status: client.status(),
                    shared: false,
                });
            }
        }
        entries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(entries)
    }

    /// Flat tool list across the requested subset of the user's servers.
    /// Names are exposed in prefixed form so collisions across servers can
    /// never alias.
    pub async fn tools_for(&self, user_id: &str, enabled_ids: &[String]) -> Vec<ToolDescriptor> {
        self.startup_reconcile(user_id).await;
        let registry = self.registry(user_id).await;
        let inner = registry.inner.lock().await;

        let mut tools = Vec::new();
        for id in enabled_ids {
            if let Some(client) = inner.clients.get(id) {
                tools.extend(client.tools());
            }
        }
        tools
    }

    /// Dispatch a prefixed tool call. Every failure mode is folded into an
    /// error-flagged result so the agent loop can hand it back to the model.
    pub async fn call_tool(
        &self,
        user_id: &str,
        enabled_ids: &[String],
        prefixed_name: &str,
        arguments: Value,
    ) -> ToolCallResult {
        let Some((server_id, tool_name)) = prefixed_name.split_once(TOOL_PREFIX_SEP) else {
            return ToolCallResult::error("", prefixed_name, format!(
                "tool '{prefixed_name}' is not in server__tool form"
            ));
        };
        if !enabled_ids.iter().any(|id| id == server_id) {
            return ToolCallResult::error(
                server_id,
                tool_name,
                format!("server '{server_id}' is not enabled for this turn"),
            );
        }

        let registry = self.registry(user_id).await;
        let client = {
            let inner = registry.inner.lock().await;
            inner.clients.get(server_id).cloned()
        };
        let Some(client) = client else {
            return ToolCallResult::error(
                server_id,
                tool_name,
                format!("server '{server_id}' is not connected"),
            );
        };

        match client.call_tool(tool_name, arguments).await {
            Ok((is_error, content)) => ToolCallResult {
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                is_error,
                content,
            },
            Err(e) => {
                tracing::warn!(user_id, server_id, tool_name, kind = e.kind(), error = %e,
                    "mcp: tool call failed");
                ToolCallResult::error(server_id, tool_name, format!("[{}] {e}", e.kind()))
            }
        }
    }

    /// Close every client for every user. Used on process shutdown, inside
    /// the bounded drain window.
    pub async fn shutdown_all(&self) {
        let users: Vec<Arc<UserRegistry>> = self.users.read().await.values().cloned().collect();
        for registry in users {
            let clients: Vec<Arc<McpClient>> = {
                let mut inner = registry.inner.lock().await;
                inner.clients.drain().map(|(_, c)| c).collect()
            };
            for client in clients {
                client.shutdown().await;
            }
        }
    }
}

/// User ids are opaque; squash anything path-hostile before using one as a
/// scratch directory name.
fn sanitize_for_path(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_with(shared: Vec<ServerSpec>) -> (tempfile::TempDir, McpSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::file(dir.path().join("servers.json"));
        let sup = McpSupervisor::new(
            store,
            shared,
            dir.path().join("scratch"),
            Duration::from_millis(200),
            Duration::from_secs(2),
        );
        (dir, sup)
    }

    fn bad_spec(id: &str) -> ServerSpec {
        // Valid shape, but the command exits immediately without speaking
        // MCP, so connect() always fails the handshake.
        ServerSpec {
            server_id: id.into(),
            server_name: String::new(),
            command: "node".into(),
            args: vec!["definitely-missing.js".into()],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn add_rejects_invalid_spec_before_touching_store() {
        let (_dir, sup) = supervisor_with(Vec::new());
        let spec = ServerSpec {
            server_id: "x".into(),
            server_name: String::new(),
            command: "bash".into(),
            args: vec!["-c".into()],
            env: HashMap::new(),
        };
        let err = sup.add("u1", spec).await.unwrap_err();
        assert_eq!(err.kind(), "validation:unknown-command");
        assert!(sup.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_spawn_rolls_back_persisted_spec() {
        let (_dir, sup) = supervisor_with(Vec::new());
        let err = sup.add("u1", bad_spec("broken")).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            "mcp:spawn-failed" | "mcp:handshake-timeout" | "mcp:transport"
        ));
        // Rollback means the next list does not show the server at all.
        assert!(sup.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent_for_unknown_ids() {
        let (_dir, sup) = supervisor_with(Vec::new());
        sup.remove("u1", "ghost").await.unwrap();
        sup.remove("u1", "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn shared_servers_appear_for_every_user_and_resist_removal() {
        let shared = ServerSpec {
            server_id: "corp-search".into(),
            server_name: "Corp Search".into(),
            command: "uvx".into(),
            args: vec!["corp-search-mcp".into()],
            env: HashMap::new(),
        };
        let (_dir, sup) = supervisor_with(vec![shared]);

        let listed = sup.list("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].shared);

        // Per-user remove is a no-op for shared specs.
        sup.remove("u1", "corp-search").await.unwrap();
        assert_eq!(sup.list("u1").await.unwrap().len(), 1);

        // A user-supplied spec may not shadow a shared id.
        let clash = ServerSpec {
            server_id: "corp-search".into(),
            server_name: String::new(),
            command: "uvx".into(),
            args: vec!["other".into()],
            env: HashMap::new(),
        };
        let err = sup.add("u1", clash).await.unwrap_err();
        assert_eq!(err.kind(), "validation:duplicate-server");
    }

    #[tokio::test]
    async fn call_tool_folds_unknown_server_into_error_result() {
        let (_dir, sup) = supervisor_with(Vec::new());
        let result = sup
            .call_tool("u1", &["fs".into()], "fs__read_file", serde_json::json!({}))
            .await;
        assert!(result.is_error);
        assert_eq!(result.server_id, "fs");
        assert_eq!(result.tool_name, "read_file");
    }

    #[test]
    fn path_sanitization_squashes_separators() {
        assert_eq!(sanitize_for_path("alice@corp"), "alice_corp");
        assert_eq!(sanitize_for_path("../../etc"), "______etc");
        assert_eq!(sanitize_for_path("user-01_x"), "user-01_x");
    }
}
