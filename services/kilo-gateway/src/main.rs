//! Kilo Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Kilo session cookies
//! 2. Accepts OpenAI-compatible chat completion requests
//! 3. Relays them to the Claude-shaped or OpenRouter-shaped Kilo endpoint
//! 4. Rotates cookies on credential-scoped rejections

mod chat;
mod config;
mod error;
mod metrics;
mod reactivate;
mod service;
mod tokens;
mod transport;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cookie_pool::CookiePool;
use metrics_exporter_prometheus::PrometheusHandle;
use relay::Orchestrator;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::Reactivator;

use crate::chat::ChatState;
use crate::config::Config;
use crate::reactivate::HttpReactivator;
use crate::service::{DRAIN_TIMEOUT, ServiceStats};
use crate::tokens::TiktokenCounter;
use crate::transport::HttpTransport;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    chat: ChatState,
    stats: ServiceStats,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn pool(&self) -> &Arc<CookiePool> {
        self.chat.orchestrator.pool()
    }
}

/// Build the axum router with all routes and shared state.
///
/// The /v1 routes live under `route_prefix`; health and metrics stay at the
/// root for probes and scrapers.
fn build_router(state: AppState, route_prefix: &str, max_connections: usize) -> Router {
    Router::new()
        .route(
            &format!("{route_prefix}/v1/chat/completions"),
            post(chat_handler),
        )
        .route(&format!("{route_prefix}/v1/models"), get(models_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
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

    info!("starting kilo-gateway");

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

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        route_prefix = %config.server.route_prefix,
        base_url = %config.upstream.base_url,
        proxy = config.upstream.proxy_url.is_some(),
        reactivation = config.reactivation.is_some(),
        pre_messages = config.request.pre_messages.len(),
        cookies = config.pool.cookies.len(),
        "configuration loaded"
    );

    if config.pool.cookies.is_empty() {
        warn!("no cookies configured, every chat request will fail until KL_COOKIE is set");
    }

    let client = transport::build_client(
        config.upstream.timeout(),
        config.upstream.proxy_url.as_deref(),
    )
    .context("failed to build upstream HTTP client")?;

    // One pool for the process lifetime: evictions only hold within it.
    let pool = Arc::new(CookiePool::new(
        config.pool.cookies.iter().map(|c| c.expose().as_str()),
    ));

    let reactivator = config.reactivation.as_ref().map(|r| {
        Arc::new(HttpReactivator::new(client.clone(), r.url.clone())) as Arc<dyn Reactivator>
    });

    let orchestrator = Orchestrator::new(
        pool,
        Arc::new(HttpTransport::new(client, config.upstream.base_url.clone())),
        reactivator,
        Arc::new(TiktokenCounter::new()),
        config.pool.rate_limit_lock(),
    );

    let stats = ServiceStats::new();
    let app_state = AppState {
        chat: ChatState {
            orchestrator: Arc::new(orchestrator),
            pre_messages: Arc::new(config.request.pre_messages.clone()),
            default_max_tokens: config.request.default_max_tokens,
            stats: stats.clone(),
        },
        stats: stats.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(
        app_state,
        &config.server.route_prefix,
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain window starts at signal receipt, not at server start.
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
            let remaining = stats.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn chat_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    chat::chat_completions(&state.chat, request, new_request_id()).await
}

async fn models_handler() -> impl IntoResponse {
    axum::Json(chat::model_list())
}

/// Health endpoint: pool state plus process counters.
/// Returns 503 when no cookie is currently usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool().health().await;
    let available = body["cookies_available"].as_u64().unwrap_or(0);

    body["uptime_seconds"] = state.stats.started_at.elapsed().as_secs().into();
    body["requests_served"] = state.stats.requests_total.load(Ordering::Relaxed).into();
    body["errors_total"] = state.stats.errors_total.load(Ordering::Relaxed).into();
    body["in_flight"] = state.stats.in_flight.load(Ordering::Relaxed).into();

    let status_code = if available > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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
