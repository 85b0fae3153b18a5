//! Gemini Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys, each limited to a few uses per minute
//! 2. Accepts `POST /generate` with a JSON prompt
//! 3. Schedules a key round-robin for every attempt, waiting when all are spent
//! 4. Retries failed attempts along a configured model/temperature plan

mod config;
mod generate;
mod metrics;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{CredentialScheduler, RetryOrchestrator, RetrySettings};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{GeminiGenerator, Generator};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, DEFAULT_PLAN};
use crate::generate::{GatewayState, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    scheduler: Arc<CredentialScheduler>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/plans/{name}/generate", post(plan_generate_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// One orchestrator per plan, all sharing the scheduler and generator.
fn build_orchestrators(
    config: &Config,
    scheduler: &Arc<CredentialScheduler>,
    generator: &Arc<dyn Generator>,
    settings: RetrySettings,
) -> BTreeMap<String, Arc<RetryOrchestrator>> {
    config
        .attempt_plans()
        .into_iter()
        .map(|(name, plan)| {
            let orchestrator =
                RetryOrchestrator::new(scheduler.clone(), generator.clone(), plan, settings);
            (name, Arc::new(orchestrator))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env in the working directory fills in unset env vars (LOG_LEVEL,
    // API_KEYS, CONFIG_PATH), so it loads before anything reads them
    let dotenv_path = std::env::current_dir()
        .ok()
        .and_then(|dir| config::load_dotenv(&dir));

    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    if let Some(path) = &dotenv_path {
        info!(path = %path.display(), "loaded .env file");
    }

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

    let scheduler = Arc::new(
        CredentialScheduler::new(
            config.credentials(),
            config.quota_policy(),
            config.poll_interval(),
        )
        .context("failed to build credential pool")?,
    );

    let generator: Arc<dyn Generator> = Arc::new(GeminiGenerator::new(
        reqwest::Client::new(),
        config.upstream.base_url.clone(),
    ));
    let plans = build_orchestrators(&config, &scheduler, &generator, config.retry_settings());

    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %config.upstream.base_url,
        credentials = scheduler.len(),
        uses_per_window = config.pool.uses_per_window,
        window_secs = config.pool.window_secs,
        plans = ?plans.keys().collect::<Vec<_>>(),
        "configuration loaded"
    );

    let app_state = AppState {
        gateway: GatewayState {
            plans: Arc::new(plans),
            metrics: ServiceMetrics::new(),
        },
        scheduler,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting on SIGTERM/SIGINT, then give in-flight
    // requests drain_timeout_secs to finish. The timer starts at signal receipt.
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
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

    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// POST /generate runs the default plan.
async fn generate_handler(State(state): State<AppState>, body: Bytes) -> Response {
    generate::generate(&state.gateway, DEFAULT_PLAN, &body, new_request_id()).await
}

/// POST /plans/{name}/generate runs a named plan.
async fn plan_generate_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    generate::generate(&state.gateway, &name, &body, new_request_id()).await
}

/// Health endpoint: uptime, request counters and per-key pool usage.
///
/// Always 200. A saturated pool still serves requests, it only delays them.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.gateway.metrics;
    let snapshot = state.scheduler.snapshot().await;
    let plans: serde_json::Map<String, serde_json::Value> = state
        .gateway
        .plans
        .iter()
        .map(|(name, orchestrator)| (name.clone(), orchestrator.plan().len().into()))
        .collect();

    let body = serde_json::json!({
        "status": snapshot.status(),
        "uptime_seconds": metrics.started_at.elapsed().as_secs(),
        "requests_served": metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": metrics.errors_total.load(Ordering::Relaxed),
        "plans": plans,
        "pool": snapshot.to_json(),
    });

    (
        axum::http::StatusCode::OK,
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
