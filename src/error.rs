//! Gateway error type. Every failure the HTTP surface can emit carries a
//! stable machine-readable `kind` alongside a short human reason; nothing in
//! a response body ever includes an internal path or a subprocess detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::validate::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing bearer token")]
    AuthMissingToken,

    #[error("invalid bearer token")]
    AuthBadToken,

    #[error("X-User-ID header is required")]
    AuthMissingUser,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("MCP server id '{0}' already registered")]
    ServerExists(String),

    #[error("failed to launch MCP server: {0}")]
    McpSpawnFailed(String),

    #[error("MCP handshake did not complete within {0}s")]
    McpHandshakeTimeout(u64),

    #[error("MCP transport error: {0}")]
    McpTransport(String),

    #[error("tool call timed out")]
    McpToolTimeout,

    #[error("tool raised an error: {0}")]
    McpToolRaised(String),

    #[error("upstream model error: {0}")]
    ModelUpstream(String),

    #[error("config store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("secret resolution failed: {0}")]
    SecretResolution(String),

    #[error("extra_params.use_swarm is reserved and must not be true")]
    SwarmReserved,

    #[error("stream was cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Stable error kind, used in response bodies and stream `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AuthMissingToken => "auth:missing-token",
            GatewayError::AuthBadToken => "auth:bad-token",
            GatewayError::AuthMissingUser => "auth:missing-user",
            GatewayError::Validation(e) => e.kind(),
            GatewayError::UnknownModel(_) => "validation:unknown-model",
            GatewayError::ServerExists(_) => "validation:duplicate-server",
            GatewayError::McpSpawnFailed(_) => "mcp:spawn-failed",
            GatewayError::McpHandshakeTimeout(_) => "mcp:handshake-timeout",
            GatewayError::McpTransport(_) => "mcp:transport",
            GatewayError::McpToolTimeout => "mcp:tool-timeout",
            GatewayError::McpToolRaised(_) => "mcp:tool-raised",
            GatewayError::ModelUpstream(_) => "model:upstream",
            GatewayError::StoreUnavailable(_) => "store:unavailable",
            GatewayError::SecretResolution(_) => "secrets:unavailable",
            GatewayError::SwarmReserved => "validation:swarm-reserved",
            GatewayError::Cancelled => "session:superseded",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissingToken | GatewayError::AuthBadToken => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::AuthMissingUser
            | GatewayError::Validation(_)
            | GatewayError::UnknownModel(_)
            | GatewayError::ServerExists(_)
            | GatewayError::SwarmReserved => StatusCode::BAD_REQUEST,
            GatewayError::McpSpawnFailed(_)
            | GatewayError::McpHandshakeTimeout(_)
            | GatewayError::McpTransport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StoreUnavailable(_) | GatewayError::SecretResolution(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        } else {
            tracing::warn!(kind = self.kind(), "{}", self);
        }
        let body = json!({ "error": { "kind": self.kind(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}
