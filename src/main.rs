use axum::http::{header, HeaderValue};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use agentgate_backend::config::GatewayConfig;
use agentgate_backend::session::spawn_sweeper;
use agentgate_backend::state::AppState;
use agentgate_backend::{auth, build_cors, create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env()?;
    init_tracing(&config);

    let state = AppState::new(config).await?;

    // Fail fast when the API credential cannot be resolved: a gateway that
    // rejects every request is worse than one that refuses to start.
    state.secrets.get_api_key().await?;

    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let frame_deny: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );

    let cors = build_cors(&state.config.allowed_origins);
    let mut app = create_router(state.clone())
        .layer(RequestBodyLimitLayer::new(state.config.body_limit))
        .layer(cors)
        .layer(nosniff)
        .layer(frame_deny)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        );
    if state.config.use_https {
        app = app.layer(axum::middleware::from_fn(auth::require_https));
    }

    let _sweeper = spawn_sweeper(state.sessions.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("agentgate backend listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Bounded drain: cancel every stream, then close every MCP client.
    tracing::info!("shutting down: cancelling streams and closing MCP clients");
    state.sessions.shutdown().await;
    state.supervisor.shutdown_all().await;

    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json");

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agentgate.log");
            if json {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(appender)
                    .with_ansi(false)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(appender)
                    .with_ansi(false)
                    .init();
            }
        }
        None => {
            if json {
                tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(env_filter).init();
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("shutdown signal received");
}
