//! Metrond write worker
//!
//! Drains validated metric records from the Redis stream and persists them
//! to the configured storage backend. A delivery is acknowledged only after
//! the write succeeds, so records survive a worker crash and are reclaimed
//! from dead consumers on the next reclaim tick.
//!
//! Multiple workers can run against the same consumer group; each gets a
//! unique consumer name and the group splits deliveries between them.
//!
//! # Configuration
//!
//! The worker reads configuration from:
//! 1. `--config` flag (path to TOML file)
//! 2. `METROND_CONFIG` environment variable (path to TOML file)
//! 3. `./metrond.toml` in current directory
//! 4. Environment variables over built-in defaults
//!
//! # Example Usage
//!
//! ```bash
//! # Run against the default relational backend
//! ./worker
//!
//! # Run against the tagged Redis backend
//! METROND_BACKEND=tagged ./worker
//! ```

use clap::Parser;
use metrond::config::{Config, StorageKind};
use metrond::redis::{QueueConsumer, RedisPool};
use metrond::storage::{MetricStore, RelationalStore, TaggedStore};
use metrond::writer::Writer;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Attempts made waiting for backends before giving up
const PROBE_ATTEMPTS: u32 = 30;

/// Delay between probe attempts
const PROBE_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Command Line
// =============================================================================

/// Write worker for the metrond pipeline
#[derive(Debug, Parser)]
#[command(name = "worker", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<String>,
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

/// Connect the shared Redis pool, waiting for the server to come up
///
/// Mirrors a fresh deployment where the worker starts before Redis is
/// accepting connections.
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
///
/// The tagged store shares the queue's Redis pool; the relational store
/// opens (and bootstraps) its SQLite database.
async fn init_store(
    config: &Config,
    pool: &Arc<RedisPool>,
) -> Result<Arc<dyn MetricStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn MetricStore> = match config.storage.backend {
        StorageKind::Tagged => Arc::new(TaggedStore::new(
            Arc::clone(pool),
            config.storage.key_prefix.clone(),
        )),
        StorageKind::Relational => {
            Arc::new(RelationalStore::open(&config.storage.sqlite_path).await?)
        }
    };
    Ok(store)
}

/// Wait for the queue and storage backends to come up
///
/// Mirrors a fresh deployment where the worker starts before Redis or the
/// database volume is ready.
async fn wait_for_backends(
    pool: &RedisPool,
    store: &Arc<dyn MetricStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    for attempt in 1..=PROBE_ATTEMPTS {
        let queue_ok = pool.ping().await.is_ok();
        let store_ok = store.ping().await.is_ok();
        if queue_ok && store_ok {
            info!(attempt, "Backends reachable");
            return Ok(());
        }
        warn!(attempt, queue_ok, store_ok, "Backends not ready, retrying");
        tokio::time::sleep(PROBE_DELAY).await;
    }

    Err(format!("backends unreachable after {PROBE_ATTEMPTS} attempts").into())
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
    let (config, config_source) = load_config(&args)?;
    config.validate()?;

    // RUST_LOG wins over the configured level when both are set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_source,
        "Metrond worker starting"
    );

    let pool = connect_pool(&config).await?;
    info!(redis = %pool.target(), "Redis pool initialized");

    let store = init_store(&config, &pool).await?;
    info!(backend = store.backend_id(), "Storage backend ready");

    wait_for_backends(&pool, &store).await?;

    let consumer = QueueConsumer::new(Arc::clone(&pool), config.queue.clone()).await?;
    info!(
        consumer = consumer.consumer_name(),
        stream = %config.queue.stream,
        group = %config.queue.group,
        "Consumer registered"
    );

    let writer = Writer::new(consumer, Arc::clone(&store), &config.queue);
    let stats = writer.stats();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    writer.run(shutdown_rx).await;

    let snapshot = stats.snapshot();
    let pool_stats = pool.metrics();
    info!(
        delivered = snapshot.delivered,
        written = snapshot.written,
        write_failures = snapshot.write_failures,
        reclaimed = snapshot.reclaimed,
        redis_commands = pool_stats.commands_executed,
        redis_retries = pool_stats.retries,
        "Worker shutdown complete"
    );
    Ok(())
}
