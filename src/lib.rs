pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod mcp;
pub mod provider;
pub mod secrets;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;
pub mod validate;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use state::AppState;

/// Build the application router. Extracted from `main()` so integration
/// tests can drive the app without binding a socket. Cross-cutting layers
/// (CORS, body limit, tracing) are applied by the caller.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/list/models", get(handlers::list_models))
        .route("/v1/list/mcp_server", get(handlers::list_mcp_server))
        .route("/v1/add/mcp_server", post(handlers::add_mcp_server))
        .route(
            "/v1/remove/mcp_server/{server_id}",
            delete(handlers::remove_mcp_server),
        )
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/stop/stream/{stream_id}", post(handlers::stop_stream))
        .route("/v1/remove/history", post(handlers::remove_history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/health", get(handlers::health_detailed))
        .merge(protected)
        .with_state(state)
}

/// CORS from the configured allow-list. An empty list means deny-all: the
/// layer never emits an allow-origin header and browsers refuse the
/// response. Wildcards are not accepted.
pub fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-user-id"),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}
