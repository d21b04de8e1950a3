//! Credential pool gateway
//!
//! Single-binary service that:
//! 1. Authenticates clients by gateway API key
//! 2. Admits requests against per-user rate limits and daily quotas
//! 3. Serves each request from a pool of upstream credentials, rotating and
//!    falling back across backend targets on failure
//! 4. Keeps OAuth credentials fresh in the background

mod admin;
mod api;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::{Cipher, PlaintextCipher};
use credential_pool::{
    CredentialPool, Maintenance, MemoryStore, Notifier, Orchestrator, QuotaEngine, RateLimiter,
    PRUNE_INTERVAL, StateChange, Store, Target, TokenBroker, UsageLogger, now_millis,
    spawn_refresh_task, spawn_usage_pruning,
};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{HttpProvider, Provider};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::api::ApiState;
use crate::config::Config;

/// Longest wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    api: ApiState,
    pool: Arc<CredentialPool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Everything wired together from one config.
struct Gateway {
    store: Arc<MemoryStore>,
    notifier: Notifier,
    pool: Arc<CredentialPool>,
    quota: Arc<QuotaEngine>,
    orchestrator: Arc<Orchestrator>,
    maintenance: Arc<Maintenance>,
    cipher: Arc<dyn Cipher>,
}

impl Gateway {
    fn build(config: &Config, store: Arc<MemoryStore>, http_client: reqwest::Client) -> Self {
        let dyn_store: Arc<dyn Store> = store.clone();
        let notifier = Notifier::new();
        let cipher: Arc<dyn Cipher> = Arc::new(PlaintextCipher);

        let broker = Arc::new(TokenBroker::new(
            dyn_store.clone(),
            cipher.clone(),
            http_client.clone(),
            config.oauth.settings(),
        ));
        let pool = Arc::new(CredentialPool::new(
            dyn_store.clone(),
            config.pool.mode,
            config.cooldown.clone(),
            config.quota.clone(),
            notifier.clone(),
        ));
        let quota = Arc::new(QuotaEngine::new(dyn_store.clone(), config.quota.clone()));
        let limiter = Arc::new(RateLimiter::new(dyn_store.clone(), config.rate_limit.clone()));

        let timeout = Duration::from_secs(config.server.timeout_secs);
        let providers: Vec<(Arc<dyn Provider>, &config::TargetConfig)> = config
            .targets
            .iter()
            .map(|t| {
                let provider: Arc<dyn Provider> =
                    Arc::new(HttpProvider::new(&t.name, &t.url, http_client.clone(), timeout));
                (provider, t)
            })
            .collect();

        let mut orchestrator = Orchestrator::new(
            dyn_store.clone(),
            pool.clone(),
            broker.clone(),
            quota.clone(),
            limiter,
            UsageLogger::new(dyn_store.clone(), notifier.clone()),
            config.pool.retry.clone(),
        )
        .with_models(config.models.table());
        for (provider, t) in &providers {
            orchestrator = orchestrator
                .with_target(Target::new(&t.name, provider.clone()).with_families(&t.families));
        }

        let mut maintenance = Maintenance::new(
            dyn_store,
            broker,
            config.maintenance.clone(),
            notifier.clone(),
        )
        .with_pool(pool.clone());
        if let Some((primary, _)) = providers.first() {
            maintenance = maintenance.with_probe(primary.clone());
        }

        Self {
            store,
            notifier,
            pool,
            quota,
            orchestrator: Arc::new(orchestrator),
            maintenance: Arc::new(maintenance),
            cipher,
        }
    }

    fn app_state(&self, prometheus: PrometheusHandle) -> AppState {
        AppState {
            api: ApiState {
                store: self.store.clone(),
                orchestrator: self.orchestrator.clone(),
                quota: self.quota.clone(),
            },
            pool: self.pool.clone(),
            prometheus,
            started_at: Instant::now(),
        }
    }

    fn admin_state(&self, default_base_quota: u64) -> AdminState {
        AdminState::new(
            self.store.clone(),
            self.pool.clone(),
            self.maintenance.clone(),
            self.cipher.clone(),
            default_base_quota,
        )
    }
}

/// Build the client-facing router.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/chat/completions", post(completions_handler))
        .route("/v1/usage", get(usage_handler))
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

    info!("starting pool-gateway");

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
        admin_listen_addr = ?config.server.admin_listen_addr,
        mode = ?config.pool.mode,
        targets = config.targets.len(),
        store = %config.store.path.display(),
        "configuration loaded"
    );

    let store = Arc::new(
        MemoryStore::open(config.store.path.clone())
            .await
            .with_context(|| format!("failed to open store {}", config.store.path.display()))?,
    );
    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let gateway = Gateway::build(&config, store.clone(), http_client);

    let mut background = vec![
        spawn_change_logger(gateway.notifier.subscribe()),
        spawn_usage_pruning(
            store.clone(),
            Duration::from_secs(config.store.usage_retention_hours.saturating_mul(3600)),
            PRUNE_INTERVAL,
        ),
    ];
    if config.maintenance.refresh_interval_secs > 0 {
        background.push(spawn_refresh_task(
            gateway.maintenance.clone(),
            Duration::from_secs(config.maintenance.refresh_interval_secs),
        ));
    }
    if config.store.snapshot_interval_secs > 0 {
        background.push(spawn_snapshot_task(
            store.clone(),
            Duration::from_secs(config.store.snapshot_interval_secs),
        ));
    }

    let app = build_router(
        gateway.app_state(prometheus_handle),
        config.server.max_connections,
    );
    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Both listeners drain on the same signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let admin_handle = match config.server.admin_listen_addr {
        Some(addr) => {
            let admin_listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {addr}"))?;
            let admin_app = build_admin_router(gateway.admin_state(config.quota.default_base_quota));
            let mut rx = shutdown_rx.clone();
            info!(addr = %addr, "admin API listening");
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    })
                    .await
            }))
        }
        None => None,
    };

    let mut rx = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
    });
    info!(addr = %listen_addr, "accepting requests");

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // The drain timeout starts at signal receipt.
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }
    if let Some(handle) = admin_handle {
        handle.abort();
    }
    for task in background {
        task.abort();
    }

    if let Err(e) = store.persist().await {
        error!(error = %e, "failed to write final store snapshot");
    }

    info!("shutdown complete");
    Ok(())
}

/// Write the store snapshot every `interval`, skipping the immediate first tick.
fn spawn_snapshot_task(store: Arc<MemoryStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.persist().await {
                Ok(()) => debug!("store snapshot written"),
                Err(e) => warn!(error = %e, "store snapshot failed"),
            }
        }
    })
}

/// Trace state changes at debug level for operators following the pool live.
fn spawn_change_logger(mut rx: broadcast::Receiver<StateChange>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => debug!(?change, "state change"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "state change log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Health endpoint: pool summary plus uptime.
/// Returns 200 when healthy or degraded, 503 when no credential is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = match state.pool.health(now_millis()).await {
        Ok(mut health) => {
            health["uptime_seconds"] = uptime.into();
            let code = if health["status"] == "unhealthy" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (code, health)
        }
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "uptime_seconds": uptime,
                }),
            )
        }
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
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    api::chat_completions(&state.api, &headers, body, new_request_id()).await
}

async fn usage_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    api::usage(&state.api, &headers, new_request_id()).await
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

#[cfg(test)]
mod tests;
