//! Metrond ingestion agent
//!
//! This binary is the write-side boundary of the pipeline. It accepts
//! metric drafts over HTTP, validates them, fills defaults, and enqueues
//! the resulting records on the Redis stream. Nothing is persisted here;
//! the worker drains the stream and writes to storage.
//!
//! # Endpoints
//!
//! ## Ingestion
//! - `POST /metrics` - Validate and enqueue a single metric
//! - `POST /metrics/batch` - Validate and enqueue a batch of metrics
//!
//! ## Admin
//! - `GET /health` - Liveness check
//!
//! # Configuration
//!
//! The agent reads configuration from:
//! 1. `--config` flag (path to TOML file)
//! 2. `METROND_CONFIG` environment variable (path to TOML file)
//! 3. `./metrond.toml` in current directory
//! 4. Environment variables over built-in defaults
//!
//! # Example Usage
//!
//! ```bash
//! # Start the agent with default config
//! ./agent
//!
//! # Start with custom config
//! METROND_CONFIG=/etc/metrond.toml ./agent
//!
//! # Queue a single metric
//! curl -X POST http://localhost:5000/metrics \
//!   -H "Content-Type: application/json" \
//!   -d '{"name": "page_clicks", "value": 1, "tags": {"page": "home"}}'
//!
//! # Queue a batch (invalid entries are skipped, not fatal)
//! curl -X POST http://localhost:5000/metrics/batch \
//!   -H "Content-Type: application/json" \
//!   -d '{"metrics": [
//!     {"name": "cpu_percent", "value": 42.5, "source": "web-01"},
//!     {"name": "request_latency_ms", "value": 87.0}
//!   ]}'
//! ```

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use metrond::config::Config;
use metrond::redis::{IngestQueue, RedisPool};
use metrond::types::RecordDraft;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Command Line
// =============================================================================

/// Ingestion agent for the metrond pipeline
#[derive(Debug, Parser)]
#[command(name = "agent", version)]
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
    queue: IngestQueue,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Batch ingestion request
#[derive(Debug, Deserialize)]
struct BatchRequest {
    metrics: Vec<RecordDraft>,
}

/// Acknowledgement for an accepted metric
#[derive(Debug, Serialize)]
struct QueuedResponse {
    status: &'static str,
}

/// Batch ingestion summary
#[derive(Debug, Serialize)]
struct BatchResponse {
    queued_count: usize,
    total_count: usize,
}

/// Error payload for rejected or failed requests
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Health response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

// =============================================================================
// API Handlers
// =============================================================================

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Validate a single draft and enqueue it
///
/// A draft without a `source` is attributed to the client socket address.
/// Validation failures are the client's problem (400); a failed enqueue is
/// ours (503, retryable).
async fn ingest_metric(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(draft): Json<RecordDraft>,
) -> impl IntoResponse {
    let origin = addr.ip().to_string();

    let record = match draft.validate(Some(&origin)) {
        Ok(record) => record,
        Err(e) => {
            debug!(origin = %origin, error = %e, "Rejected metric draft");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    match state.queue.enqueue(&record).await {
        Ok(delivery_id) => {
            debug!(name = %record.name, delivery_id = %delivery_id, "Metric queued");
            (StatusCode::ACCEPTED, Json(QueuedResponse { status: "queued" })).into_response()
        }
        Err(e) => {
            error!(name = %record.name, error = %e, "Failed to enqueue metric");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "ingest queue unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Validate a batch of drafts and enqueue the valid ones
///
/// Invalid entries are skipped rather than failing the whole batch; the
/// response counts report how many made it onto the queue.
async fn ingest_batch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<BatchRequest>,
) -> impl IntoResponse {
    let origin = addr.ip().to_string();
    let total_count = request.metrics.len();
    let mut queued_count = 0;

    for draft in request.metrics {
        let record = match draft.validate(Some(&origin)) {
            Ok(record) => record,
            Err(e) => {
                debug!(origin = %origin, error = %e, "Skipping invalid draft in batch");
                continue;
            }
        };

        match state.queue.enqueue(&record).await {
            Ok(_) => queued_count += 1,
            Err(e) => {
                error!(name = %record.name, error = %e, "Failed to enqueue batch metric");
            }
        }
    }

    debug!(queued_count, total_count, "Batch processed");
    (
        StatusCode::ACCEPTED,
        Json(BatchResponse {
            queued_count,
            total_count,
        }),
    )
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

/// Build the router with all endpoints
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", post(ingest_metric))
        .route("/metrics/batch", post(ingest_batch))
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
        config.agent.host = host;
    }
    if let Some(port) = args.port {
        config.agent.port = port;
    }
    config.validate()?;

    // RUST_LOG wins over the configured level when both are set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_source,
        "Metrond agent starting"
    );

    let pool = Arc::new(RedisPool::new(&config.redis).await?);
    info!(redis = %pool.target(), "Redis pool initialized");

    let state = Arc::new(AppState {
        queue: IngestQueue::new(pool, config.queue.clone()),
    });

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.agent.host, config.agent.port).parse()?;
    info!(addr = %addr, "Agent listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // ConnectInfo feeds the fallback source attribution in the handlers
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Agent shutdown complete");
    Ok(())
}
