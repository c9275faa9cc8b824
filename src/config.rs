//! Process configuration: environment variables plus an optional gateway
//! config file (`MCP_CONF`) declaring the model catalog and shared MCP
//! servers. Everything is read once at startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::mcp::ServerSpec;
use crate::provider::{ProviderConfig, ProviderKind};

const DEFAULT_PORT: u16 = 7002;
const DEFAULT_BODY_LIMIT: usize = 25 * 1024 * 1024;
const DEFAULT_IDLE_MINUTES: u64 = 30;
const DEFAULT_MAX_TURNS: usize = 200;
const DEFAULT_HANDSHAKE_SECS: u64 = 30;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,
    pub model_name: String,
    #[serde(default)]
    pub provider: Option<String>,
}

pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Raw `API_KEY` value: a literal bearer token or an `arn:` reference.
    pub api_key: String,
    pub allowed_origins: Vec<String>,
    pub use_https: bool,
    pub idle_horizon: Duration,
    pub max_turns: usize,
    pub body_limit: usize,
    pub handshake_timeout: Duration,
    pub tool_timeout: Duration,
    pub scratch_root: PathBuf,
    pub user_config_file: PathBuf,
    pub database_url: Option<String>,
    pub secrets_endpoint: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub models: Vec<ModelEntry>,
    pub shared_servers: Vec<ServerSpec>,
    pub default_provider: String,
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayConfFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default, rename = "mcpServers")]
    mcp_servers: std::collections::HashMap<String, SharedServerConf>,
}

#[derive(Debug, Deserialize)]
struct SharedServerConf {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    #[serde(default)]
    description: String,
    /// `Some(0)` disables the entry without deleting it from the file.
    #[serde(default)]
    status: Option<i64>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("API_KEY")
            .map_err(|_| anyhow::anyhow!("API_KEY is required"))?;

        let allowed_origins: Vec<String> = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let idle_minutes: u64 = env_or("INACTIVE_TIME", &DEFAULT_IDLE_MINUTES.to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("INACTIVE_TIME must be an integer (minutes)"))?;

        let (models, shared_servers) = match std::env::var("MCP_CONF") {
            Ok(path) if !path.is_empty() => load_conf_file(&path)?,
            _ => (Vec::new(), Vec::new()),
        };

        let anthropic = std::env::var("ANTHROPIC_API_KEY").ok().map(|key| ProviderConfig {
            api_key: key,
            base_url: env_or("ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
        });
        let openai = std::env::var("OPENAI_API_KEY").ok().map(|key| ProviderConfig {
            api_key: key,
            base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
        });

        Ok(Self {
            host: env_or("MCP_SERVICE_HOST", "127.0.0.1"),
            port: env_or("MCP_SERVICE_PORT", &DEFAULT_PORT.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MCP_SERVICE_PORT must be a port number"))?,
            api_key,
            allowed_origins,
            use_https: env_or("USE_HTTPS", "") == "1" || env_or("USE_HTTPS", "") == "true",
            idle_horizon: Duration::from_secs(idle_minutes * 60),
            max_turns: env_or("MAX_TURNS", &DEFAULT_MAX_TURNS.to_string())
                .parse()
                .unwrap_or(DEFAULT_MAX_TURNS),
            body_limit: DEFAULT_BODY_LIMIT,
            handshake_timeout: Duration::from_secs(
                env_or("MCP_HANDSHAKE_TIMEOUT", &DEFAULT_HANDSHAKE_SECS.to_string())
                    .parse()
                    .unwrap_or(DEFAULT_HANDSHAKE_SECS),
            ),
            tool_timeout: Duration::from_secs(
                env_or("MCP_TOOL_TIMEOUT", &DEFAULT_TOOL_TIMEOUT_SECS.to_string())
                    .parse()
                    .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
            ),
            scratch_root: PathBuf::from(env_or("MCP_SCRATCH_ROOT", "/tmp/agentgate")),
            user_config_file: PathBuf::from(env_or(
                "USER_MCP_CONFIG_FILE",
                "conf/user_mcp_configs.json",
            )),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            secrets_endpoint: std::env::var("SECRETS_ENDPOINT").ok().filter(|s| !s.is_empty()),
            log_dir: std::env::var("LOG_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            models,
            shared_servers,
            default_provider: env_or("MODEL_PROVIDER", "anthropic"),
            anthropic,
            openai,
        })
    }

    pub fn provider_kind_for(&self, model: &ModelEntry) -> Option<ProviderKind> {
        let name = model.provider.as_deref().unwrap_or(&self.default_provider);
        ProviderKind::parse(name)
    }

    pub fn provider_config_for(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        match kind {
            ProviderKind::Anthropic => self.anthropic.as_ref(),
            ProviderKind::Openai => self.openai.as_ref(),
        }
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.model_id == model_id)
    }
}

fn load_conf_file(path: &str) -> anyhow::Result<(Vec<ModelEntry>, Vec<ServerSpec>)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read MCP_CONF {path}: {e}"))?;
    let conf: GatewayConfFile = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("invalid MCP_CONF {path}: {e}"))?;

    let mut shared = Vec::new();
    for (server_id, entry) in conf.mcp_servers {
        if entry.status == Some(0) {
            continue;
        }
        let spec = ServerSpec {
            server_id: server_id.clone(),
            server_name: if entry.description.is_empty() {
                server_id.clone()
            } else {
                entry.description.clone()
            },
            command: entry.command,
            args: entry.args,
            env: entry.env,
        };
        // Shared specs are operator-supplied but go through the same gate as
        // user specs; a bad entry is skipped, not fatal.
        match crate::validate::validate_spec(&spec) {
            Ok(()) => shared.push(spec),
            Err(e) => {
                tracing::warn!(%server_id, error = %e, "config: skipping invalid shared server");
            }
        }
    }
    shared.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    Ok((conf.models, shared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn conf_file_parses_models_and_shared_servers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "models": [
                    {{ "model_id": "claude-x", "model_name": "Claude X" }},
                    {{ "model_id": "gpt-x", "model_name": "GPT X", "provider": "openai" }}
                ],
                "mcpServers": {{
                    "search": {{ "command": "uvx", "args": ["mcp-search"], "description": "Search" }},
                    "disabled": {{ "command": "uvx", "args": ["mcp-x"], "status": 0 }},
                    "injector": {{ "command": "bash", "args": ["-c", "id"] }}
                }}
            }}"#
        )
        .unwrap();

        let (models, shared) = load_conf_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].provider.as_deref(), Some("openai"));

        // Disabled and invalid entries are dropped.
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].server_id, "search");
        assert_eq!(shared[0].server_name, "Search");
    }

    #[test]
    fn missing_conf_file_is_an_error() {
        assert!(load_conf_file("/nonexistent/path.json").is_err());
    }
}
