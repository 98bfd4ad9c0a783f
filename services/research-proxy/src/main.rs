//! Research upstream session-pool gateway
//!
//! Single-binary Rust service that:
//! 1. Loads the durable account credential record
//! 2. Tracks per-account health through heartbeat probes and outcome reports
//! 3. Serves health, metrics, and the pool snapshot on the public listener
//! 4. Serves account/config administration on a separate token-gated listener

mod admin;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use account_pool::{HttpProbe, Pool, spawn_heartbeat_task};
use session_store::CredentialStore;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;

/// How long in-flight requests get to drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state for the public listener.
#[derive(Clone)]
struct AppState {
    pool: Arc<Pool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public axum router: health, metrics, and the read-only pool
/// snapshot for dashboards. Account credentials never transit this listener.
fn build_public_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/pool", get(pool_handler))
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

    info!("starting research-proxy");

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
        admin_listen_addr = %config.server.admin_listen_addr,
        upstream = %config.upstream.base_url,
        credentials = %config.pool.credentials_path.display(),
        "configuration loaded"
    );

    // A broken account record is fatal at startup: the pool must not come up
    // with a membership it cannot trust.
    let store = CredentialStore::load(config.pool.credentials_path.clone())
        .await
        .map_err(|e| anyhow::anyhow!("loading credential store: {e}"))?;
    let store = Arc::new(store);

    let (pool, probe_rx) = Pool::new(store, config.pool_settings())
        .await
        .map_err(|e| anyhow::anyhow!("building pool: {e}"))?;
    let pool = Arc::new(pool);

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.request_timeout_secs))
        .build()
        .context("building HTTP client")?;
    let probe = Arc::new(HttpProbe::new(
        http_client,
        &config.upstream.base_url,
        &config.upstream.probe_path,
    ));
    let heartbeat = spawn_heartbeat_task(pool.clone(), probe, probe_rx);

    let app_state = AppState {
        pool: pool.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let public = build_public_router(app_state, config.server.max_connections);

    let admin_token = config
        .server
        .admin_token
        .clone()
        .context("admin token missing after config validation")?;
    let admin = build_admin_router(AdminState::new(pool.clone(), admin_token));

    let public_listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.admin_listen_addr))?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_listen_addr,
        "accepting requests"
    );

    // Both listeners drain on the same signal; the drain timeout starts at
    // signal receipt, so a slow client cannot block process exit.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut public_shutdown = shutdown_rx.clone();
    let public_handle = tokio::spawn(async move {
        axum::serve(public_listener, public)
            .with_graceful_shutdown(async move {
                let _ = public_shutdown.changed().await;
            })
            .await
    });

    let mut admin_shutdown = shutdown_rx;
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin)
            .with_graceful_shutdown(async move {
                let _ = admin_shutdown.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("public", public_handle), ("admin", admin_handle)] {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => info!(listener = name, "drained"),
            Ok(Ok(Err(e))) => error!(listener = name, error = %e, "server error during shutdown"),
            Ok(Err(e)) => error!(listener = name, error = %e, "server task panicked"),
            Err(_) => warn!(
                listener = name,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            ),
        }
    }

    // A sweep aborted mid-flight is safe: unvisited accounts keep their
    // prior state, and nothing is probing once the process is gone anyway.
    heartbeat.abort();

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while at least one account is selectable, 503 once
/// the pool has no capacity. Body carries the pool counts and uptime.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.pool.snapshot().await;
    let status_code = if snapshot.has_capacity() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": snapshot.status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts_total": snapshot.accounts_total,
        "accounts_normal": snapshot.accounts_normal,
        "accounts_degraded": snapshot.accounts_degraded,
        "accounts_unavailable": snapshot.accounts_unavailable,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Read-only pool snapshot for dashboards. Tokens appear only as masked
/// suffixes.
async fn pool_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.pool.snapshot().await;
    let body = serde_json::to_string(&snapshot)
        .unwrap_or_else(|_| r#"{"error":"snapshot serialization failed"}"#.to_string());
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
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
