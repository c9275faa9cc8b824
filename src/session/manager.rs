//! Per-user session directory and the process-wide stream registry. One
//! async lock per user; the idle sweep visits users one at a time and never
//! holds more than one lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::AgentSession;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct SessionManager {
    users: tokio::sync::RwLock<HashMap<String, Arc<UserSessions>>>,
    /// Every in-flight stream's cancellation token, keyed by stream id.
    streams: std::sync::Mutex<HashMap<String, StreamHandle>>,
    idle_horizon: Duration,
}

struct UserSessions {
    /// model_id → session
    sessions: tokio::sync::Mutex<HashMap<String, Arc<AgentSession>>>,
}

struct StreamHandle {
    user_id: String,
    token: CancellationToken,
}

impl SessionManager {
    pub fn new(idle_horizon: Duration) -> Self {
        Self {
            users: tokio::sync::RwLock::new(HashMap::new()),
            streams: std::sync::Mutex::new(HashMap::new()),
            idle_horizon,
        }
    }

    async fn user_sessions(&self, user_id: &str) -> Arc<UserSessions> {
        if let Some(existing) = self.users.read().await.get(user_id) {
            return Arc::clone(existing);
        }
        let mut users = self.users.write().await;
        Arc::clone(users.entry(user_id.to_string()).or_insert_with(|| {
            Arc::new(UserSessions {
                sessions: tokio::sync::Mutex::new(HashMap::new()),
            })
        }))
    }

    /// Return the existing (user, model) session with a refreshed activity
    /// stamp, or construct one via `build`.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        model_id: &str,
        build: impl FnOnce() -> AgentSession,
    ) -> Arc<AgentSession> {
        let user = self.user_sessions(user_id).await;
        let mut sessions = user.sessions.lock().await;
        let session = sessions
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(build()));
        session.touch();
        Arc::clone(session)
    }

    // ── Stream registry ─────────────────────────────────────────────────

    pub fn register_stream(&self, stream_id: &str, user_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.streams.lock().unwrap().insert(
            stream_id.to_string(),
            StreamHandle {
                user_id: user_id.to_string(),
                token: token.clone(),
            },
        );
        token
    }

    pub fn unregister_stream(&self, stream_id: &str) {
        self.streams.lock().unwrap().remove(stream_id);
    }

    /// Cooperative cancel. Unknown ids and already-finished streams report
    /// success too, so a stop button can never produce a user-visible error.
    /// When a caller is known, cancelling someone else's stream is refused.
    pub fn cancel_stream(&self, stream_id: &str, user_id: Option<&str>) -> bool {
        let streams = self.streams.lock().unwrap();
        match streams.get(stream_id) {
            Some(handle) => {
                if let Some(user_id) = user_id {
                    if handle.user_id != user_id {
                        return false;
                    }
                }
                handle.token.cancel();
                true
            }
            None => true,
        }
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Drop every session a user holds (the `/v1/remove/history` path).
    /// Active streams are cancelled; MCP clients are untouched.
    pub async fn remove_user_sessions(&self, user_id: &str) {
        let Some(user) = self.users.read().await.get(user_id).cloned() else {
            return;
        };
        let mut sessions = user.sessions.lock().await;
        for session in sessions.values() {
            session.cancel_active();
        }
        sessions.clear();
    }

    /// Periodic sweep: sessions idle past the horizon are closed. The active
    /// stream (if any) is cancelled and the history is dropped; the user's
    /// McpClients stay up, since tool servers are owned by the supervisor.
    pub async fn evict_idle(&self) -> usize {
        let users: Vec<(String, Arc<UserSessions>)> = self
            .users
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut evicted = 0;
        for (user_id, user) in users {
            let mut sessions = user.sessions.lock().await;
            sessions.retain(|model_id, session| {
                let stale = session.idle_for() > self.idle_horizon;
                if stale {
                    tracing::info!(%user_id, %model_id, "session: evicting idle session");
                    session.cancel_active();
                    evicted += 1;
                }
                !stale
            });
        }
        evicted
    }

    /// Cancel every stream and drop every session. Used on shutdown.
    pub async fn shutdown(&self) {
        for handle in self.streams.lock().unwrap().values() {
            handle.token.cancel();
        }
        let users: Vec<Arc<UserSessions>> = self.users.read().await.values().cloned().collect();
        for user in users {
            user.sessions.lock().await.clear();
        }
        self.users.write().await.clear();
    }
}

/// Background eviction sweep, in the style of a watchdog task: one tick per
/// minute, each tick takes per-user locks strictly in turn.
pub fn spawn_sweeper(manager: Arc<SessionManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("session sweeper started (interval={}s)", SWEEP_INTERVAL.as_secs());
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let evicted = manager.evict_idle().await;
            if evicted > 0 {
                tracing::info!(evicted, "session sweeper: evicted idle sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::McpSupervisor;
    use crate::provider::{ProviderConfig, ProviderKind};
    use crate::store::ConfigStore;

    fn test_session(dir: &tempfile::TempDir, user: &str, model: &str) -> AgentSession {
        let supervisor = Arc::new(McpSupervisor::new(
            ConfigStore::file(dir.path().join("servers.json")),
            Vec::new(),
            dir.path().join("scratch"),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        AgentSession::new(
            user.to_string(),
            model.to_string(),
            ProviderKind::Openai,
            ProviderConfig { api_key: "k".into(), base_url: "http://127.0.0.1:1".into() },
            reqwest::Client::new(),
            supervisor,
        )
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session_for_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(Duration::from_secs(60));
        let a = manager
            .get_or_create("u1", "m1", || test_session(&dir, "u1", "m1"))
            .await;
        let b = manager
            .get_or_create("u1", "m1", || test_session(&dir, "u1", "m1"))
            .await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager
            .get_or_create("u1", "m2", || test_session(&dir, "u1", "m2"))
            .await;
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn stop_is_idempotent_success_for_unknown_streams() {
        let manager = SessionManager::new(Duration::from_secs(60));
        assert!(manager.cancel_stream("ghost", None));
        assert!(manager.cancel_stream("ghost", None));
    }

    #[tokio::test]
    async fn cancel_requires_matching_user_when_known() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let token = manager.register_stream("s1", "u1");
        assert!(!manager.cancel_stream("s1", Some("u2")));
        assert!(!token.is_cancelled());
        assert!(manager.cancel_stream("s1", Some("u1")));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_fresh_ones_kept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(Duration::from_millis(20));
        manager
            .get_or_create("u1", "m1", || test_session(&dir, "u1", "m1"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Touch a second session after the sleep so only the first is stale.
        manager
            .get_or_create("u1", "m2", || test_session(&dir, "u1", "m2"))
            .await;

        let evicted = manager.evict_idle().await;
        assert_eq!(evicted, 1);

        // A new request on the evicted key gets a fresh session.
        let fresh = manager
            .get_or_create("u1", "m1", || test_session(&dir, "u1", "m1"))
            .await;
        assert_eq!(fresh.history_len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_registered_streams() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let token = manager.register_stream("s1", "u1");
        manager.shutdown().await;
        assert!(token.is_cancelled());
    }
}
