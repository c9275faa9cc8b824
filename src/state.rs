//! Shared application state handed to every handler.

use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::mcp::McpSupervisor;
use crate::provider::{ProviderConfig, ProviderKind};
use crate::secrets::SecretsResolver;
use crate::session::SessionManager;
use crate::store::ConfigStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub secrets: Arc<SecretsResolver>,
    pub supervisor: Arc<McpSupervisor>,
    pub sessions: Arc<SessionManager>,
    pub client: Client,
    pub start_time: Instant,
}

impl AppState {
    /// Construct state from config, choosing the store backend: Postgres
    /// when `DATABASE_URL` is set (migrations run here), the JSON file
    /// otherwise.
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let store = match &config.database_url {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(std::time::Duration::from_secs(3))
                    .connect(url)
                    .await?;
                sqlx::migrate!("./migrations").run(&pool).await?;
                ConfigStore::postgres(pool)
            }
            None => ConfigStore::file(config.user_config_file.clone()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Wire everything up around an already-chosen store. Used directly by
    /// tests so they can run against the file backend.
    pub fn with_store(config: GatewayConfig, store: ConfigStore) -> Self {
        let client = Client::new();
        let supervisor = Arc::new(McpSupervisor::new(
            store,
            config.shared_servers.clone(),
            config.scratch_root.clone(),
            config.handshake_timeout,
            config.tool_timeout,
        ));
        let sessions = Arc::new(SessionManager::new(config.idle_horizon));
        let secrets = Arc::new(SecretsResolver::new(
            config.api_key.clone(),
            config.secrets_endpoint.clone(),
            client.clone(),
        ));
        Self {
            config: Arc::new(config),
            secrets,
            supervisor,
            sessions,
            client,
            start_time: Instant::now(),
        }
    }

    /// Resolve the provider backing a configured model id.
    pub fn provider_for(
        &self,
        model_id: &str,
    ) -> Result<(ProviderKind, ProviderConfig), GatewayError> {
        let model = self
            .config
            .model(model_id)
            .ok_or_else(|| GatewayError::UnknownModel(model_id.to_string()))?;
        let kind = self
            .config
            .provider_kind_for(model)
            .ok_or_else(|| GatewayError::UnknownModel(model_id.to_string()))?;
        let cfg = self.config.provider_config_for(kind).ok_or_else(|| {
            GatewayError::ModelUpstream(format!(
                "no credentials configured for the provider backing '{model_id}'"
            ))
        })?;
        Ok((kind, cfg.clone()))
    }
}
