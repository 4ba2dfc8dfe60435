//! Copilot Gateway
//!
//! Single-binary service that exposes an OpenAI-compatible chat-completions
//! endpoint backed by a pool of Copilot refresh tokens:
//! 1. Translates inbound request bodies to the upstream dialect
//! 2. Exchanges refresh tokens for short-lived access tokens, cached per credential
//! 3. Rotates credentials on rate limits with exponential backoff
//! 4. Relays buffered and streamed (SSE) completions to the client

mod admin;
mod config;
mod metrics;
mod proxy;
mod translate;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use copilot_pool::{BackoffPolicy, CredentialPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::ProxyState;

/// Inbound request bodies larger than this are rejected before translation.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// In-flight requests get this long to drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub(crate) struct AppState {
    pub proxy: ProxyState,
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
    pub prometheus: PrometheusHandle,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_handler))
        .route("/chat/completions", post(chat_handler))
        .route("/tokens/cycle", post(admin::cycle_handler))
        .route("/tokens/status", get(admin::status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting copilot-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        completions_url = %config.upstream.completions_url,
        credentials = config.credentials.refresh_tokens.len(),
        "configuration loaded"
    );

    let client = reqwest::Client::new();
    let credentials = std::mem::take(&mut config.credentials.refresh_tokens);
    let pool = Arc::new(
        CredentialPool::new(
            credentials,
            BackoffPolicy::default(),
            config.upstream.token_url.clone(),
            client.clone(),
            Duration::from_secs(copilot_auth::TOKEN_EXCHANGE_TIMEOUT_SECS),
        )
        .context("failed to initialize credential pool")?,
    );

    let proxy_state = ProxyState {
        client,
        pool,
        completions_url: config.upstream.completions_url.clone(),
        timeout: Duration::from_secs(config.upstream.timeout_secs),
    };

    let app_state = AppState {
        proxy: proxy_state,
        started_at: Instant::now(),
        requests_total: Arc::new(AtomicU64::new(0)),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT bounds the drain so a stalled stream cannot block exit
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Completion handler: reads the body, runs the rotation loop, records
/// request metrics. For streamed responses the duration covers time to
/// response headers, not the full stream.
async fn chat_handler(
    State(state): State<AppState>,
    request: axum::http::Request<Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let method = request.method().to_string();
    let started = Instant::now();

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            let response = proxy::error_response(
                axum::http::StatusCode::BAD_REQUEST,
                "malformed_request",
                &format!("failed to read request body: {e}"),
                &request_id,
            );
            metrics::record_request(
                response.status().as_u16(),
                &method,
                started.elapsed().as_secs_f64(),
            );
            return response;
        }
    };

    let response = proxy::chat_completions(&state.proxy, &body, &request_id).await;

    state.requests_total.fetch_add(1, Ordering::Relaxed);
    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Health endpoint: 200 while at least one credential is eligible, 503 once
/// every credential is under backoff.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.proxy.pool.status();
    let limited = status
        .credentials
        .iter()
        .filter(|c| c.is_rate_limited)
        .count();
    let available = status.total_credentials - limited;

    let health = match available {
        0 => "unhealthy",
        n if n < status.total_credentials => "degraded",
        _ => "healthy",
    };
    let status_code = if available == 0 {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": health,
        "credentials_total": status.total_credentials,
        "credentials_available": available,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.requests_total.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
