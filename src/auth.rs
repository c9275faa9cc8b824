//! Request authentication: a server-side bearer token shared by all
//! callers, and an opaque `X-User-ID` header that scopes every user-facing
//! operation. Public routes (health) bypass this middleware entirely.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::state::AppState;

const MAX_USER_ID_LEN: usize = 128;

/// Middleware enforcing `Authorization: Bearer <token>` against the
/// resolved API key.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return Err(GatewayError::AuthMissingToken.into_response());
    };

    let expected = state
        .secrets
        .get_api_key()
        .await
        .map_err(|e| e.into_response())?;

    if token != expected {
        tracing::warn!("auth failed: invalid bearer token");
        return Err(GatewayError::AuthBadToken.into_response());
    }
    Ok(next.run(request).await)
}

/// The tenant identity carried in `X-User-ID`. Opaque, non-empty,
/// printable, bounded.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if value.is_empty()
            || value.len() > MAX_USER_ID_LEN
            || value.chars().any(|c| c.is_control())
        {
            return Err(GatewayError::AuthMissingUser.into_response());
        }
        Ok(UserId(value.to_string()))
    }
}

/// Middleware for proxy-terminated TLS deployments: requests that arrived
/// over plain HTTP (per `X-Forwarded-Proto`) are redirected, and every
/// response carries HSTS.
pub async fn require_https(req: Request, next: Next) -> Response {
    let proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");

    if proto == "http" {
        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{host}{path_and_query}");
        let mut response = (
            axum::http::StatusCode::MOVED_PERMANENTLY,
            [("location", location)],
        )
            .into_response();
        add_hsts(&mut response);
        return response;
    }

    let mut response = next.run(req).await;
    add_hsts(&mut response);
    response
}

fn add_hsts(response: &mut Response) {
    response.headers_mut().insert(
        "strict-transport-security",
        axum::http::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
}
