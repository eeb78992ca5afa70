//! Metrond query server
//!
//! Read-side HTTP API over the persisted metrics. The server never touches
//! the ingest queue; it answers from whichever storage backend the
//! configuration names, so it can run against a database the worker is
//! still filling.
//!
//! # Endpoints
//!
//! ## Query
//! - `GET /api/metrics` - Raw records, newest first
//! - `GET /api/metrics/aggregate` - Time-bucketed aggregates
//! - `GET /api/metrics/names` - Distinct metric names
//!
//! ## Admin
//! - `GET /health` - Storage-backed health check
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `--config` flag (path to TOML file)
//! 2. `METROND_CONFIG` environment variable (path to TOML file)
//! 3. `./metrond.toml` in current directory
//! 4. Environment variables over built-in defaults
//!
//! # Example Usage
//!
//! ```bash
//! # Start the server with default config
//! ./server
//!
//! # Raw records for one metric over an explicit range
//! curl "http://localhost:8000/api/metrics?name=cpu_percent&start_time=2024-05-01T00:00:00Z&end_time=2024-05-02T00:00:00Z&limit=50"
//!
//! # Hourly means over the lookback window
//! curl "http://localhost:8000/api/metrics/aggregate?name=cpu_percent&window=1h&aggregate=mean"
//!
//! # Every metric name the store has seen
//! curl "http://localhost:8000/api/metrics/names"
//! ```

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use metrond::aggregate::{AggregateBucket, AggregateFn, Window};
use metrond::config::{Config, StorageKind};
use metrond::query::QueryService;
use metrond::redis::RedisPool;
use metrond::storage::{MetricStore, RawQuery, RelationalStore, TaggedStore};
use metrond::types::parse_timestamp;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Attempts made waiting for the backend before giving up
const PROBE_ATTEMPTS: u32 = 30;

/// Delay between probe attempts
const PROBE_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Command Line
// =============================================================================

/// Query server for the metrond pipeline
#[derive(Debug, Parser)]
#[command(name = "server", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Listen host override
    #[arg(long)]
    host: Option<String>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,
}

// =============================================================================
// Application State
// =============================================================================

/// Shared state for all handlers
struct AppState {
    service: QueryService,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query string for `/api/metrics`
#[derive(Debug, Deserialize)]
struct RawParams {
    name: Option<String>,
    source: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<usize>,
}

/// Query string for `/api/metrics/aggregate`
///
/// Unrecognized `window` or `aggregate` values fall back to the defaults
/// (1h / mean) rather than erroring, so dashboards with stale dropdowns
/// keep rendering.
#[derive(Debug, Deserialize)]
struct AggregateParams {
    name: Option<String>,
    window: Option<String>,
    aggregate: Option<String>,
}

/// Error payload for failed requests
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Health response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: String,
    version: &'static str,
}

// =============================================================================
// API Handlers
// =============================================================================

/// Health check endpoint, backed by a storage ping
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = state.service.backend_id().to_string();
    match state.service.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                backend,
                version: env!("CARGO_PKG_VERSION"),
            }),
        ),
        Err(e) => {
            error!(backend = %backend, error = %e, "Health ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    backend,
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
        }
    }
}

/// Raw records matching the filters, newest first
async fn raw_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RawParams>,
) -> impl IntoResponse {
    let mut query = RawQuery::default();

    if let Some(name) = params.name {
        query = query.with_name(name);
    }
    if let Some(source) = params.source {
        query = query.with_source(source);
    }
    if let Some(raw) = params.start_time.as_deref() {
        match parse_timestamp(raw) {
            Ok(start) => query = query.with_start(start),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: format!("invalid start_time: {e}"),
                    }),
                )
                    .into_response();
            }
        }
    }
    if let Some(raw) = params.end_time.as_deref() {
        match parse_timestamp(raw) {
            Ok(end) => query = query.with_end(end),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: format!("invalid end_time: {e}"),
                    }),
                )
                    .into_response();
            }
        }
    }
    if let Some(limit) = params.limit {
        query = query.with_limit(limit);
    }

    match state.service.raw(&query).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => {
            error!(error = %e, "Raw query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Time-bucketed aggregates over the lookback window, ascending
async fn aggregate_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AggregateParams>,
) -> impl IntoResponse {
    let window = params.window.as_deref().map(Window::parse).unwrap_or_default();
    let function = params
        .aggregate
        .as_deref()
        .map(AggregateFn::parse)
        .unwrap_or_default();

    let buckets: Result<Vec<AggregateBucket>, _> = state
        .service
        .aggregate(params.name.as_deref(), window, function)
        .await;

    match buckets {
        Ok(buckets) => (StatusCode::OK, Json(buckets)).into_response(),
        Err(e) => {
            error!(window = window.as_str(), function = function.as_str(), error = %e, "Aggregate query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Distinct metric names, ascending
///
/// Always answers 200; a backend failure degrades to an empty list inside
/// the service.
async fn metric_names(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.service.names().await)
}

// =============================================================================
// Initialization
// =============================================================================

/// Load configuration from the CLI flag, `METROND_CONFIG`, or
/// `./metrond.toml`, falling back to environment defaults
///
/// An explicitly requested file that does not load is fatal; the implicit
/// candidates are skipped silently.
fn load_config(args: &Args) -> Result<(Config, String), String> {
    if let Some(path) = args.config.as_deref() {
        let config = Config::from_file_with_env(path)?;
        return Ok((config, path.to_string()));
    }

    if let Ok(path) = std::env::var("METROND_CONFIG") {
        if let Ok(config) = Config::from_file_with_env(&path) {
            return Ok((config, path));
        }
    }

    if let Ok(config) = Config::from_file_with_env("metrond.toml") {
        return Ok((config, "metrond.toml".to_string()));
    }

    Ok((Config::from_env(), "environment defaults".to_string()))
}

/// Connect the Redis pool for the tagged backend, waiting for the server
/// to come up
async fn connect_pool(config: &Config) -> Result<Arc<RedisPool>, Box<dyn std::error::Error>> {
    let mut attempt = 1;
    loop {
        match RedisPool::new(&config.redis).await {
            Ok(pool) => return Ok(Arc::new(pool)),
            Err(e) if attempt < PROBE_ATTEMPTS => {
                warn!(attempt, error = %e, "Redis not ready, retrying");
            }
            Err(e) => return Err(e.into()),
        }
        attempt += 1;
        tokio::time::sleep(PROBE_DELAY).await;
    }
}

/// Build the storage backend named by the configuration
async fn init_store(config: &Config) -> Result<Arc<dyn MetricStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn MetricStore> = match config.storage.backend {
        StorageKind::Tagged => {
            let pool = connect_pool(config).await?;
            info!(redis = %pool.target(), "Redis pool initialized");
            Arc::new(TaggedStore::new(pool, config.storage.key_prefix.clone()))
        }
        StorageKind::Relational => {
            Arc::new(RelationalStore::open(&config.storage.sqlite_path).await?)
        }
    };
    Ok(store)
}

/// Wait for the storage backend to come up
async fn wait_for_backend(store: &Arc<dyn MetricStore>) -> Result<(), Box<dyn std::error::Error>> {
    for attempt in 1..=PROBE_ATTEMPTS {
        if store.ping().await.is_ok() {
            info!(attempt, "Storage backend reachable");
            return Ok(());
        }
        warn!(attempt, backend = store.backend_id(), "Backend not ready, retrying");
        tokio::time::sleep(PROBE_DELAY).await;
    }

    Err(format!("storage backend unreachable after {PROBE_ATTEMPTS} attempts").into())
}

/// Build the router with all endpoints
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/metrics", get(raw_metrics))
        .route("/api/metrics/aggregate", get(aggregate_metrics))
        .route("/api/metrics/names", get(metric_names))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let (mut config, config_source) = load_config(&args)?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    // RUST_LOG wins over the configured level when both are set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_source,
        "Metrond query server starting"
    );

    let store = init_store(&config).await?;
    info!(backend = store.backend_id(), "Storage backend ready");

    wait_for_backend(&store).await?;

    let state = Arc::new(AppState {
        service: QueryService::new(store, config.aggregation.clone()),
    });

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(addr = %addr, "Query server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Query server shutdown complete");
    Ok(())
}
