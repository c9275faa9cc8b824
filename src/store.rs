//! Durable per-user MCP server registrations.
//!
//! Two backends behind one interface: Postgres when `DATABASE_URL` is
//! configured, otherwise a JSON file next to the process. Only validated
//! specs are ever written, and a write must be acknowledged before the
//! supervisor spawns the corresponding subprocess.

use std::collections::HashMap;
use std::path::PathBuf;

use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::mcp::ServerSpec;

type UserSpecs = HashMap<String, HashMap<String, ServerSpec>>;

pub enum ConfigStore {
    Postgres(PgPool),
    File(FileStore),
}

impl ConfigStore {
    pub fn postgres(pool: PgPool) -> Self {
        ConfigStore::Postgres(pool)
    }

    pub fn file(path: PathBuf) -> Self {
        ConfigStore::File(FileStore {
            path,
            cache: Mutex::new(None),
        })
    }

    /// Upsert one (user, server) row.
    pub async fn put(&self, user_id: &str, spec: &ServerSpec) -> Result<(), GatewayError> {
        match self {
            ConfigStore::Postgres(pool) => {
                let json = serde_json::to_string(spec)
                    .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
                sqlx::query(
                    "INSERT INTO gw_mcp_servers (user_id, server_id, spec) VALUES ($1, $2, $3) \
                     ON CONFLICT (user_id, server_id) DO UPDATE SET spec = $3, updated_at = NOW()",
                )
                .bind(user_id)
                .bind(&spec.server_id)
                .bind(&json)
                .execute(pool)
                .await
                .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
                Ok(())
            }
            ConfigStore::File(fs) => {
                let mut guard = fs.cache.lock().await;
                let all = fs.loaded(&mut guard).await?;
                all.entry(user_id.to_string())
                    .or_default()
                    .insert(spec.server_id.clone(), spec.clone());
                fs.persist(all).await
            }
        }
    }

    /// Delete one (user, server) row. Deleting a row that does not exist is
    /// a success.
    pub async fn delete(&self, user_id: &str, server_id: &str) -> Result<(), GatewayError> {
        match self {
            ConfigStore::Postgres(pool) => {
                sqlx::query("DELETE FROM gw_mcp_servers WHERE user_id = $1 AND server_id = $2")
                    .bind(user_id)
                    .bind(server_id)
                    .execute(pool)
                    .await
                    .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
                Ok(())
            }
            ConfigStore::File(fs) => {
                let mut guard = fs.cache.lock().await;
                let all = fs.loaded(&mut guard).await?;
                if let Some(servers) = all.get_mut(user_id) {
                    servers.remove(server_id);
                    if servers.is_empty() {
                        all.remove(user_id);
                    }
                }
                fs.persist(all).await
            }
        }
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ServerSpec>, GatewayError> {
        match self {
            ConfigStore::Postgres(pool) => {
                let rows: Vec<(String,)> = sqlx::query_as(
                    "SELECT spec FROM gw_mcp_servers WHERE user_id = $1 ORDER BY server_id",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
                Ok(rows
                    .into_iter()
                    .filter_map(|(json,)| serde_json::from_str(&json).ok())
                    .collect())
            }
            ConfigStore::File(fs) => {
                let mut guard = fs.cache.lock().await;
                let all = fs.loaded(&mut guard).await?;
                let mut specs: Vec<ServerSpec> =
                    all.get(user_id).map(|m| m.values().cloned().collect()).unwrap_or_default();
                specs.sort_by(|a, b| a.server_id.cmp(&b.server_id));
                Ok(specs)
            }
        }
    }

    pub async fn get(
        &self,
        user_id: &str,
        server_id: &str,
    ) -> Result<Option<ServerSpec>, GatewayError> {
        match self {
            ConfigStore::Postgres(pool) => {
                let row: Option<(String,)> = sqlx::query_as(
                    "SELECT spec FROM gw_mcp_servers WHERE user_id = $1 AND server_id = $2",
                )
                .bind(user_id)
                .bind(server_id)
                .fetch_optional(pool)
                .await
                .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
                Ok(row.and_then(|(json,)| serde_json::from_str(&json).ok()))
            }
            ConfigStore::File(fs) => {
                let mut guard = fs.cache.lock().await;
                let all = fs.loaded(&mut guard).await?;
                Ok(all.get(user_id).and_then(|m| m.get(server_id)).cloned())
            }
        }
    }
}

/// JSON-file backend. The whole map is held behind one async mutex and
/// rewritten on every mutation; registration changes are rare enough that
/// this never shows up on the hot path.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Option<UserSpecs>>,
}

impl FileStore {
    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<UserSpecs>,
    ) -> Result<&'a mut UserSpecs, GatewayError> {
        if guard.is_none() {
            let specs = match tokio::fs::read_to_string(&self.path).await {
                Ok(raw) => serde_json::from_str(&raw)
                    .map_err(|e| GatewayError::StoreUnavailable(format!("parse {}: {e}", self.path.display())))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => UserSpecs::default(),
                Err(e) => {
                    return Err(GatewayError::StoreUnavailable(format!(
                        "read {}: {e}",
                        self.path.display()
                    )))
                }
            };
            *guard = Some(specs);
        }
        Ok(guard.as_mut().unwrap())
    }

    async fn persist(&self, all: &UserSpecs) -> Result<(), GatewayError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(all)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> ServerSpec {
        ServerSpec {
            server_id: id.into(),
            server_name: format!("{id} server"),
            command: "npx".into(),
            args: vec!["-y".into(), format!("mcp-{id}")],
            env: HashMap::new(),
        }
    }

    fn file_store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::file(dir.path().join("conf").join("servers.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_and_list() {
        let (_dir, store) = file_store();
        store.put("u1", &spec("fs")).await.unwrap();
        store.put("u1", &spec("web")).await.unwrap();

        assert_eq!(store.get("u1", "fs").await.unwrap(), Some(spec("fs")));
        let listed = store.list("u1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].server_id, "fs");
        assert_eq!(listed[1].server_id, "web");

        // Other users see nothing.
        assert!(store.list("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_is_upsert_on_same_key() {
        let (_dir, store) = file_store();
        store.put("u1", &spec("fs")).await.unwrap();
        let mut replacement = spec("fs");
        replacement.args = vec!["-y".into(), "mcp-other".into()];
        store.put("u1", &replacement).await.unwrap();

        let listed = store.list("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].args[1], "mcp-other");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = file_store();
        store.put("u1", &spec("fs")).await.unwrap();
        store.delete("u1", "fs").await.unwrap();
        store.delete("u1", "fs").await.unwrap();
        store.delete("u1", "never-existed").await.unwrap();
        assert!(store.get("u1", "fs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let store = ConfigStore::file(path.clone());
        store.put("u1", &spec("fs")).await.unwrap();
        drop(store);

        let reopened = ConfigStore::file(path);
        assert_eq!(reopened.get("u1", "fs").await.unwrap(), Some(spec("fs")));
    }
}
