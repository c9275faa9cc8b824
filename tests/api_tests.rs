//! Router-level integration tests. Everything runs against the real router
//! with the file-backed config store: no database, no network, no MCP
//! subprocesses (specs that would spawn one are rejected by validation
//! before any spawn happens).

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use agentgate_backend::config::{GatewayConfig, ModelEntry};
use agentgate_backend::provider::ProviderConfig;
use agentgate_backend::state::AppState;
use agentgate_backend::store::ConfigStore;
use agentgate_backend::{build_cors, create_router};

const API_KEY: &str = "test-api-key";
const ALLOWED_ORIGIN: &str = "http://localhost:5173";

fn test_config(dir: &tempfile::TempDir) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        api_key: API_KEY.into(),
        allowed_origins: vec![ALLOWED_ORIGIN.into()],
        use_https: false,
        idle_horizon: Duration::from_secs(60),
        max_turns: 10,
        body_limit: 1024 * 1024,
        handshake_timeout: Duration::from_millis(300),
        tool_timeout: Duration::from_secs(2),
        scratch_root: dir.path().join("scratch"),
        user_config_file: dir.path().join("conf").join("servers.json"),
        database_url: None,
        secrets_endpoint: None,
        log_dir: None,
        models: vec![
            ModelEntry {
                model_id: "claude-test".into(),
                model_name: "Claude Test".into(),
                provider: Some("anthropic".into()),
            },
            ModelEntry {
                model_id: "gpt-test".into(),
                model_name: "GPT Test".into(),
                provider: Some("openai".into()),
            },
        ],
        shared_servers: Vec::new(),
        default_provider: "anthropic".into(),
        // Unreachable on purpose: chat tests that get this far assert the
        // upstream-error path, not a live completion.
        anthropic: Some(ProviderConfig {
            api_key: "k".into(),
            base_url: "http://127.0.0.1:9".into(),
        }),
        openai: Some(ProviderConfig {
            api_key: "k".into(),
            base_url: "http://127.0.0.1:9".into(),
        }),
    }
}

fn test_state(dir: &tempfile::TempDir) -> AppState {
    let config = test_config(dir);
    let store = ConfigStore::file(config.user_config_file.clone());
    AppState::with_store(config, store)
}

fn app(state: AppState) -> axum::Router {
    create_router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn authed(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
        .header("x-user-id", "u1")
}

fn authed_json(method: Method, uri: &str, body: &Value) -> Request<Body> {
    authed(method, uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
//  Health
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn health_is_public_and_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn detailed_health_sets_no_cache_headers() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "agentgate-backend");
    assert!(json["uptime_seconds"].is_u64());
}

// ═══════════════════════════════════════════════════════════════════════════
//  Auth
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn missing_token_is_401() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(Request::builder().uri("/v1/list/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["kind"], "auth:missing-token");
}

#[tokio::test]
async fn wrong_token_is_401() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(
            Request::builder()
                .uri("/v1/list/models")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["kind"], "auth:bad-token");
}

#[tokio::test]
async fn user_scoped_route_requires_user_header() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(
            Request::builder()
                .uri("/v1/list/mcp_server")
                .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["kind"], "auth:missing-user");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Models & server listing
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn list_models_returns_configured_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed(Method::GET, "/v1/list/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let models = json["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0]["model_id"], "claude-test");
    assert_eq!(models[0]["model_name"], "Claude Test");
}

#[tokio::test]
async fn new_user_has_no_servers() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed(Method::GET, "/v1/list/mcp_server").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["servers"], json!([]));
}

// ═══════════════════════════════════════════════════════════════════════════
//  Server registration validation (no subprocess is ever spawned)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn command_injection_attempt_is_rejected_and_list_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let response = app(state.clone())
        .oneshot(authed_json(
            Method::POST,
            "/v1/add/mcp_server",
            &json!({
                "server_id": "x",
                "command": "python",
                "args": ["-c", "import os; os.system('id')"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["kind"], "validation:bad-arg");

    let listing = app(state)
        .oneshot(authed(Method::GET, "/v1/list/mcp_server").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(listing).await["servers"], json!([]));
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/add/mcp_server",
            &json!({ "server_id": "sh", "command": "bash", "args": ["-c"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["kind"],
        "validation:unknown-command"
    );
}

#[tokio::test]
async fn missing_command_after_normalization_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/add/mcp_server",
            &json!({ "server_id": "nocmd", "args": ["pkg"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["kind"],
        "validation:unknown-command"
    );
}

#[tokio::test]
async fn hijacking_env_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/add/mcp_server",
            &json!({
                "server_id": "evil",
                "command": "npx",
                "args": ["-y", "mcp-thing"],
                "env": { "LD_PRELOAD": "/tmp/x.so" },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["kind"],
        "validation:bad-env-key"
    );
}

#[tokio::test]
async fn remove_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    for _ in 0..2 {
        let response = app(state.clone())
            .oneshot(
                authed(Method::DELETE, "/v1/remove/mcp_server/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Stream stop
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stop_unknown_stream_is_idempotent_success() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    for _ in 0..2 {
        let response = app(state.clone())
            .oneshot(
                authed(Method::POST, "/v1/stop/stream/stream_u1_42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["stopping"], true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Chat completions
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn swarm_flag_is_reserved() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/chat/completions",
            &json!({
                "model": "claude-test",
                "messages": [{ "role": "user", "content": "hi" }],
                "extra_params": { "use_swarm": true },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["kind"],
        "validation:swarm-reserved"
    );
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/chat/completions",
            &json!({
                "model": "not-configured",
                "messages": [{ "role": "user", "content": "hi" }],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["kind"],
        "validation:unknown-model"
    );
}

#[tokio::test]
async fn empty_messages_returns_load_probe() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/chat/completions",
            &json!({ "model": "claude-test", "messages": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["finish_reason"], "load");
    assert_eq!(json["choices"][0]["message"]["content"], "");
}

#[tokio::test]
async fn empty_messages_probe_answers_before_model_validation() {
    // A UI restore probe may carry a stale or not-yet-loaded model id; it
    // must still get the "load" response, never a validation error.
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/chat/completions",
            &json!({ "model": "stale-model-id", "messages": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["finish_reason"], "load");
    assert_eq!(json["model"], "stale-model-id");
}

#[tokio::test]
async fn streaming_response_carries_stream_id_header_and_done_frame() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/chat/completions",
            &json!({
                "model": "gpt-test",
                "stream": true,
                "messages": [{ "role": "user", "content": "hi" }],
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );
    let stream_id = response
        .headers()
        .get("x-stream-id")
        .expect("X-Stream-ID header must precede the body")
        .to_str()
        .unwrap()
        .to_string();
    assert!(stream_id.starts_with("stream_u1_"));

    // The provider endpoint is unreachable, so after retries the stream
    // ends with an error frame and [DONE].
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("model:upstream"), "missing error frame: {text}");
    assert!(text.contains("\"finish_reason\":\"error\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn non_streaming_upstream_failure_aggregates_to_error_body() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed_json(
            Method::POST,
            "/v1/chat/completions",
            &json!({
                "model": "gpt-test",
                "stream": false,
                "messages": [{ "role": "user", "content": "hi" }],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["finish_reason"], "error");
    let content = json["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("model:upstream"));
}

#[tokio::test]
async fn remove_history_succeeds_for_fresh_user() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(test_state(&dir))
        .oneshot(authed(Method::POST, "/v1/remove/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], true);
}

// ═══════════════════════════════════════════════════════════════════════════
//  CORS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn preflight_from_allowed_origin_gets_allow_origin_header() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let router = app(state.clone()).layer(build_cors(&state.config.allowed_origins));

    let response = router
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/list/models")
                .header(header::ORIGIN, ALLOWED_ORIGIN)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap()),
        Some(ALLOWED_ORIGIN)
    );
}

#[tokio::test]
async fn preflight_from_unknown_origin_lacks_allow_origin_header() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let router = app(state.clone()).layer(build_cors(&state.config.allowed_origins));

    let response = router
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/list/models")
                .header(header::ORIGIN, "https://evil.example")
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn wildcard_origins_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let router = app(state).layer(build_cors(&["*".to_string()]));

    let response = router
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/list/models")
                .header(header::ORIGIN, "https://anywhere.example")
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.headers().get("access-control-allow-origin").is_none());
}
