//! Redis connection pool with retry logic
//!
//! Wraps a multiplexed connection behind a bounded-concurrency pool with:
//! - Per-command timeouts
//! - Exponential backoff retry with jitter
//! - Automatic reconnect on connection errors
//! - Command metrics tracking
//!
//! Both the ingestion queue and the tagged store run their commands through
//! [`RedisPool::execute`]; blocking stream reads use
//! [`RedisPool::execute_with_timeout`] with a budget that covers the block.
//!
//! # Example
//!
//! ```rust,no_run
//! use metrond::config::RedisConfig;
//! use metrond::redis::RedisPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::new(&RedisConfig::default()).await?;
//! pool.ping().await?;
//! # Ok(())
//! # }
//! ```

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use super::util::{safe_redis_error, sanitize_url};
use crate::config::RedisConfig;
use crate::error::QueueError;

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub multiplier: f64,

    /// Add random jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Build a policy from the Redis config section
    pub fn from_config(config: &RedisConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            delay_ms * (1.0 + jitter)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if another attempt is allowed after the given one
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Connection pool metrics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total number of successful connections
    pub connections_created: AtomicU64,

    /// Total number of connection failures
    pub connection_failures: AtomicU64,

    /// Total number of commands executed
    pub commands_executed: AtomicU64,

    /// Total number of command failures
    pub command_failures: AtomicU64,

    /// Total number of retries
    pub retries: AtomicU64,

    /// Total command latency in microseconds
    pub total_latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_connection(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Average command latency in microseconds
    pub fn average_latency_us(&self) -> f64 {
        let total = self.total_latency_us.load(Ordering::Relaxed);
        let count = self.commands_executed.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Get a snapshot of the metrics
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
        }
    }
}

/// Snapshot of pool metrics at a point in time
#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    /// Total number of connections created during pool lifetime
    pub connections_created: u64,
    /// Total number of connection failures during pool lifetime
    pub connection_failures: u64,
    /// Total number of commands executed through the pool
    pub commands_executed: u64,
    /// Total number of command failures encountered
    pub command_failures: u64,
    /// Total number of retry attempts made for failed operations
    pub retries: u64,
    /// Average command latency in microseconds
    pub average_latency_us: f64,
}

/// Redis connection pool
///
/// Holds one multiplexed connection shared by up to `pool_size` concurrent
/// operations, reconnecting when the connection drops.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// The multiplexed connection (Redis handles multiplexing internally)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Pool configuration
    config: RedisConfig,

    /// Retry policy derived from the configuration
    retry_policy: RetryPolicy,

    /// Command metrics
    metrics: Arc<PoolMetrics>,

    /// Limits concurrent operations on the shared connection
    semaphore: Arc<Semaphore>,
}

impl RedisPool {
    /// Create a new pool and establish the initial connection
    pub async fn new(config: &RedisConfig) -> Result<Self, QueueError> {
        if config.url.is_empty() {
            return Err(QueueError::ConnectionError(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        // Sanitized URL in error messages to prevent credential leakage
        let client = Client::open(config.url.as_str())
            .map_err(|e| QueueError::ConnectionError(safe_redis_error(&config.url, &e)))?;

        let pool = Self {
            client,
            connection: RwLock::new(None),
            retry_policy: RetryPolicy::from_config(config),
            metrics: Arc::new(PoolMetrics::default()),
            semaphore: Arc::new(Semaphore::new(config.pool_size as usize)),
            config: config.clone(),
        };

        pool.connect().await?;

        debug!(redis = %pool.target(), "Redis connection pool initialized");
        Ok(pool)
    }

    /// Establish or re-establish the connection
    async fn connect(&self) -> Result<(), QueueError> {
        let start = Instant::now();

        let conn_future = self.client.get_multiplexed_async_connection();
        let conn = tokio::time::timeout(self.config.connect_timeout(), conn_future)
            .await
            .map_err(|_| {
                self.metrics.record_connection_failure();
                QueueError::ConnectionError("Connection timeout".to_string())
            })?
            .map_err(|e| {
                self.metrics.record_connection_failure();
                QueueError::ConnectionError(safe_redis_error(&self.config.url, &e))
            })?;

        {
            let mut guard = self.connection.write().await;
            *guard = Some(conn);
        }

        self.metrics.record_connection();
        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(())
    }

    /// Get the shared connection, reconnecting if necessary
    async fn get(&self) -> Result<PooledConnection, QueueError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::ConnectionError("Semaphore closed".to_string()))?;

        let conn = {
            let guard = self.connection.read().await;
            guard.clone()
        };

        let conn = match conn {
            Some(c) => c,
            None => {
                self.connect().await?;
                let guard = self.connection.read().await;
                guard
                    .clone()
                    .ok_or_else(|| QueueError::ConnectionError("No connection available".to_string()))?
            }
        };

        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Execute a command with retry logic and the configured timeout
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        self.execute_with_timeout(self.config.command_timeout(), f)
            .await
    }

    /// Execute a command with retry logic and an explicit time budget
    ///
    /// Blocking commands (stream reads with BLOCK) need a budget larger
    /// than their block interval, otherwise an empty wait is misreported
    /// as a timeout.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        budget: Duration,
        f: F,
    ) -> Result<T, QueueError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut attempt = 0;

        loop {
            let conn = self.get().await?;
            let start = Instant::now();

            let result = tokio::time::timeout(budget, f(conn.conn.clone())).await;

            match result {
                Ok(Ok(value)) => {
                    self.metrics.record_command(start.elapsed());
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    self.metrics.record_command_failure();

                    if self.retry_policy.should_retry(attempt) && is_retriable_error(&e) {
                        self.metrics.record_retry();
                        let delay = self.retry_policy.delay_for_attempt(attempt);
                        warn!(
                            "Redis command failed (attempt {}), retrying in {:?}: {}",
                            attempt + 1,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;

                        if is_connection_error(&e) {
                            let _ = self.connect().await;
                        }

                        attempt += 1;
                        continue;
                    }

                    return Err(QueueError::ConnectionError(safe_redis_error(
                        &self.config.url,
                        &e,
                    )));
                }
                Err(_) => {
                    self.metrics.record_command_failure();

                    if self.retry_policy.should_retry(attempt) {
                        self.metrics.record_retry();
                        let delay = self.retry_policy.delay_for_attempt(attempt);
                        warn!(
                            "Redis command timeout (attempt {}), retrying in {:?}",
                            attempt + 1,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(QueueError::ConnectionError("Command timeout".to_string()));
                }
            }
        }
    }

    /// Check connectivity with a PING
    pub async fn ping(&self) -> Result<(), QueueError> {
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The configured per-command timeout
    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    /// Credential-free connection target for log lines
    pub fn target(&self) -> String {
        sanitize_url(&self.config.url)
    }
}

/// A checked-out connection holding its concurrency permit
struct PooledConnection {
    conn: MultiplexedConnection,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Check if an error is retriable
fn is_retriable_error(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(e.kind(), redis::ErrorKind::BusyLoadingError)
}

/// Check if an error requires reconnection
fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_from_config() {
        let config = RedisConfig {
            max_retries: 5,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            ..Default::default()
        };

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));

        // Caps at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::default();

        metrics.record_connection();
        metrics.record_command(Duration::from_micros(100));
        metrics.record_command(Duration::from_micros(200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.commands_executed, 2);
        assert_eq!(snapshot.average_latency_us, 150.0);
    }
}
