//! Redis integration: ingestion queue and tagged-store transport
//!
//! This module provides the shared connection plumbing plus the durable
//! ingestion queue. The tagged time-series store builds on the same pool.
//!
//! # Architecture
//!
//! ```text
//! Redis Schema:
//! {stream}                     → STREAM of queued records (consumer group)
//! {prefix}:series:{name}       → ZSET(timestamp_ms → point column map JSON)
//! {prefix}:names               → ZSET(metric name → last write timestamp_ms)
//! ```
//!
//! # Features
//!
//! - Shared multiplexed connection with bounded concurrency
//! - Exponential backoff retry with jitter and per-command timeouts
//! - At-least-once delivery through a stream consumer group
//! - Credential-free error messages and log lines

// Core modules
pub mod connection;
pub mod queue;
pub mod util;

// Re-export main types
pub use connection::{PoolMetricsSnapshot, RedisPool, RetryPolicy};
pub use queue::{Delivery, DeliveryId, IngestQueue, QueueConsumer};
