//! metrond - asynchronous metrics ingestion and aggregation engine
//!
//! This library accepts arbitrary numeric metrics and serves raw and
//! time-bucketed aggregate queries over them:
//! - Durable at-least-once ingestion over a Redis stream
//! - Two interchangeable storage backends: a tagged time-series store on
//!   Redis sorted sets and a relational store on SQLite
//! - Deterministic window aggregation (1m/5m/1h/1d) with selectable
//!   reduction functions
//!
//! Producers never block on storage. The write path hands records from the
//! ingestion boundary to the queue and from there to a writer; the read
//! path goes through the query service to a backend and the aggregation
//! engine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod query;
pub mod storage;
pub mod types;
pub mod writer;

/// Redis integration: shared connection pool and the ingestion queue
pub mod redis;

// Re-export main types
pub use error::{Error, Result};
pub use types::{MetricRecord, RecordDraft};

#[cfg(test)]
mod tests {
    use crate::types::RecordDraft;

    #[test]
    fn test_crate_surface_smoke() {
        let record = RecordDraft {
            name: Some("cpu_usage".to_string()),
            value: Some(1.0),
            ..Default::default()
        }
        .validate(None)
        .unwrap();

        assert_eq!(record.name, "cpu_usage");
        assert!(record.tags.is_empty());
    }
}
