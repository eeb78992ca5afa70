//! Storage backends for persisted metric records
//!
//! This module defines the [`MetricStore`] trait and its two variants:
//!
//! - [`tagged::TaggedStore`]: time-series layout over Redis sorted sets,
//!   one physical point per record keyed by a column map of tags
//! - [`relational::RelationalStore`]: one row per record in SQLite, tags
//!   carried as an opaque JSON blob
//!
//! Both variants satisfy the same contract: a completed `write` makes the
//! record visible to subsequent queries, `query_raw` returns newest first
//! with resolved time bounds, and `query_names` returns sorted distinct
//! names. Backend transport errors are mapped into [`StorageError`] at the
//! store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::aggregate::{AggregateBucket, AggregateFn, Window};
use crate::error::StorageError;
use crate::types::MetricRecord;

pub mod relational;
pub mod tagged;

pub use relational::RelationalStore;
pub use tagged::TaggedStore;

/// Default cap on records returned by a raw query
pub const DEFAULT_RAW_LIMIT: usize = 1000;

/// Default lookback applied when a raw query has no explicit start
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Filter for raw record queries
///
/// Absent fields match everything; absent bounds default to the last 24
/// hours at execution time.
///
/// # Example
///
/// ```rust
/// use metrond::storage::RawQuery;
///
/// let query = RawQuery::default()
///     .with_name("cpu_usage")
///     .with_limit(100);
/// assert_eq!(query.limit, 100);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RawQuery {
    /// Exact metric name to match
    pub name: Option<String>,

    /// Exact source to match
    pub source: Option<String>,

    /// Inclusive start of the time range
    pub start: Option<DateTime<Utc>>,

    /// Inclusive end of the time range
    pub end: Option<DateTime<Utc>>,

    /// Maximum number of records returned
    pub limit: usize,
}

impl Default for RawQuery {
    fn default() -> Self {
        Self {
            name: None,
            source: None,
            start: None,
            end: None,
            limit: DEFAULT_RAW_LIMIT,
        }
    }
}

impl RawQuery {
    /// Match only the given metric name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Match only the given source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the inclusive start bound
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Set the inclusive end bound
    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// Cap the number of returned records
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Resolve the time bounds against a reference "now"
    ///
    /// Absent start defaults to 24 hours before `now`, absent end to `now`.
    /// An inverted range is an error rather than an empty result so callers
    /// see their mistake.
    pub fn resolve_bounds(&self, now: DateTime<Utc>) -> Result<(i64, i64), StorageError> {
        let start = self.start.unwrap_or(now - Duration::hours(DEFAULT_LOOKBACK_HOURS));
        let end = self.end.unwrap_or(now);

        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();
        if start_ms > end_ms {
            return Err(StorageError::InvalidTimeRange {
                start: start_ms,
                end: end_ms,
            });
        }
        Ok((start_ms, end_ms))
    }
}

/// Core trait for metric storage backends
#[async_trait]
pub trait MetricStore: Send + Sync + 'static {
    /// Unique identifier for this storage backend
    fn backend_id(&self) -> &str;

    /// Persist one record durably
    ///
    /// On Ok the record is visible to subsequent queries. Writes of
    /// unrelated records are safe to run concurrently.
    async fn write(&self, record: &MetricRecord) -> Result<(), StorageError>;

    /// Fetch raw records matching the filter, newest first
    async fn query_raw(&self, query: &RawQuery) -> Result<Vec<MetricRecord>, StorageError>;

    /// Distinct metric names, ascending and deduplicated
    ///
    /// Lookback policy is per backend: the tagged store bounds its scan to
    /// the last 30 days, the relational store has no bound.
    async fn query_names(&self) -> Result<Vec<String>, StorageError>;

    /// Check backend connectivity
    async fn ping(&self) -> Result<(), StorageError>;

    /// Backend-side aggregation, where the backend can do it exactly
    ///
    /// Returns `None` when this backend does not push the given function
    /// down; the caller then pulls raw records and buckets them in-process.
    /// A backend must only push down when its grouping is identical to the
    /// engine's bucket alignment.
    async fn aggregate_pushdown(
        &self,
        query: &RawQuery,
        window: Window,
        function: AggregateFn,
    ) -> Result<Option<Vec<AggregateBucket>>, StorageError> {
        let _ = (query, window, function);
        Ok(None)
    }
}
