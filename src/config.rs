//! Configuration management for metrond
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Ingestion HTTP endpoint
    #[serde(default)]
    pub agent: AgentConfig,

    /// Query HTTP endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis connection settings (queue and tagged store)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Ingestion queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Aggregation engine settings
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Ingestion endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_agent_port")]
    pub port: u16,
}

/// Query endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Redis connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Connection URL (redis://host:port/db)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Maximum concurrent operations on the shared connection
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Maximum retries for a failed command
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl RedisConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Command timeout as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Ingestion queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Stream key holding queued records
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Consumer group name for writers
    #[serde(default = "default_group")]
    pub group: String,

    /// How long a consumer blocks waiting for deliveries, in milliseconds
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Maximum deliveries fetched per read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle time before a pending delivery is reclaimed, in milliseconds
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    /// Interval between stale-delivery reclaim sweeps, in milliseconds
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Tagged time-series store over Redis sorted sets
    Tagged,
    /// Relational store over SQLite
    Relational,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Which backend variant to run
    #[serde(default = "default_backend")]
    pub backend: StorageKind,

    /// SQLite database path (relational backend)
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Key prefix for Redis structures (tagged backend)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Aggregation engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationConfig {
    /// How far back aggregation queries pull raw records, in hours
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,

    /// Cap on raw records pulled per aggregation query
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_agent_port() -> u16 {
    5000
}
fn default_server_port() -> u16 {
    8000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_pool_size() -> u32 {
    16
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    5_000
}
fn default_stream() -> String {
    "metrond:ingest".to_string()
}
fn default_group() -> String {
    "metrond-writers".to_string()
}
fn default_block_timeout_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    100
}
fn default_claim_idle_ms() -> u64 {
    60_000
}
fn default_reclaim_interval_ms() -> u64 {
    30_000
}
fn default_backend() -> StorageKind {
    StorageKind::Relational
}
fn default_sqlite_path() -> String {
    "metrond.db".to_string()
}
fn default_key_prefix() -> String {
    "metrond".to_string()
}
fn default_lookback_hours() -> u32 {
    24
}
fn default_max_samples() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_agent_port(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            group: default_group(),
            block_timeout_ms: default_block_timeout_ms(),
            batch_size: default_batch_size(),
            claim_idle_ms: default_claim_idle_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            max_samples: default_max_samples(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("METROND_AGENT_HOST") {
            self.agent.host = host;
        }
        if let Ok(port) = std::env::var("METROND_AGENT_PORT") {
            if let Ok(p) = port.parse() {
                self.agent.port = p;
            }
        }
        if let Ok(host) = std::env::var("METROND_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("METROND_SERVER_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(url) = std::env::var("METROND_REDIS_URL") {
            self.redis.url = url;
        }

        if let Ok(backend) = std::env::var("METROND_BACKEND") {
            match backend.to_lowercase().as_str() {
                "tagged" => self.storage.backend = StorageKind::Tagged,
                "relational" => self.storage.backend = StorageKind::Relational,
                _ => {}
            }
        }
        if let Ok(path) = std::env::var("METROND_SQLITE_PATH") {
            self.storage.sqlite_path = path;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.agent.port == 0 {
            return Err("Agent port cannot be 0".to_string());
        }
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.redis.pool_size == 0 {
            return Err("Redis pool size must be > 0".to_string());
        }
        if self.redis.pool_size > 1000 {
            return Err("Redis pool size cannot exceed 1000".to_string());
        }

        if self.queue.stream.is_empty() {
            return Err("Queue stream cannot be empty".to_string());
        }
        if self.queue.group.is_empty() {
            return Err("Queue group cannot be empty".to_string());
        }
        if self.queue.batch_size == 0 {
            return Err("Queue batch size must be > 0".to_string());
        }

        if self.storage.backend == StorageKind::Relational && self.storage.sqlite_path.is_empty() {
            return Err("SQLite path cannot be empty".to_string());
        }

        if self.aggregation.lookback_hours == 0 {
            return Err("Aggregation lookback must be > 0".to_string());
        }
        if self.aggregation.max_samples == 0 {
            return Err("Aggregation sample cap must be > 0".to_string());
        }

        Ok(())
    }
}
