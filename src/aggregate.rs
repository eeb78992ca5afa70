//! Time-window aggregation engine
//!
//! Buckets raw metric records into fixed windows and reduces each bucket
//! with a selectable function. The whole computation is deterministic:
//! bucket membership depends only on timestamps, members are sorted
//! chronologically before reduction (making `last` well-defined), and the
//! output is ordered by `(bucket_start, name)`.
//!
//! # Key Types
//!
//! - **`Window`**: Bucket width (1m, 5m, 1h, 1d)
//! - **`AggregateFn`**: Reduction function (mean, sum, max, min, count, last)
//! - **`AggregateBucket`**: One reduced bucket, never stored
//!
//! # Bucket alignment
//!
//! A timestamp maps to the start of its window: seconds and sub-seconds are
//! zeroed, the minute is rounded down to the window's multiple, hour windows
//! zero the minute and day windows zero the hour. All windows divide the UTC
//! epoch evenly, so alignment reduces to integer arithmetic on millisecond
//! timestamps.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use metrond::aggregate::{aggregate, AggregateFn, Window};
//! use metrond::types::MetricRecord;
//!
//! let ts = |h, m, s| Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap();
//! let records = vec![
//!     MetricRecord::new("cpu_usage", 10.0).with_timestamp(ts(10, 0, 10)),
//!     MetricRecord::new("cpu_usage", 30.0).with_timestamp(ts(10, 0, 40)),
//!     MetricRecord::new("cpu_usage", 50.0).with_timestamp(ts(10, 2, 0)),
//! ];
//!
//! let buckets = aggregate(&records, Window::OneMinute, AggregateFn::Mean);
//! assert_eq!(buckets.len(), 2);
//! assert_eq!(buckets[0].value, 20.0);
//! assert_eq!(buckets[0].sample_count, 2);
//! assert_eq!(buckets[1].value, 50.0);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::types::MetricRecord;

// ============================================================================
// Windows
// ============================================================================

/// Bucket width for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    /// One minute buckets
    OneMinute,
    /// Five minute buckets
    FiveMinutes,
    /// One hour buckets
    #[default]
    OneHour,
    /// One day buckets
    OneDay,
}

impl Window {
    /// Parse a window string, falling back to one hour
    ///
    /// Recognizes `1m`, `5m`, `1h` and `1d`; anything else is treated as
    /// the default so a bad query parameter degrades instead of erroring.
    pub fn parse(input: &str) -> Self {
        match input {
            "1m" => Window::OneMinute,
            "5m" => Window::FiveMinutes,
            "1h" => Window::OneHour,
            "1d" => Window::OneDay,
            _ => Window::OneHour,
        }
    }

    /// Window width in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Window::OneMinute => 60_000,
            Window::FiveMinutes => 300_000,
            Window::OneHour => 3_600_000,
            Window::OneDay => 86_400_000,
        }
    }

    /// Canonical string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::OneMinute => "1m",
            Window::FiveMinutes => "5m",
            Window::OneHour => "1h",
            Window::OneDay => "1d",
        }
    }
}

// ============================================================================
// Reduction Functions
// ============================================================================

/// Reduction applied to the values of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregateFn {
    /// Arithmetic mean (alias `avg`)
    #[default]
    Mean,
    /// Sum of all values
    Sum,
    /// Maximum value
    Max,
    /// Minimum value
    Min,
    /// Number of values
    Count,
    /// Chronologically latest value
    Last,
}

impl AggregateFn {
    /// Parse a function string, falling back to mean
    pub fn parse(input: &str) -> Self {
        match input {
            "mean" | "avg" => AggregateFn::Mean,
            "sum" => AggregateFn::Sum,
            "max" => AggregateFn::Max,
            "min" => AggregateFn::Min,
            "count" => AggregateFn::Count,
            "last" => AggregateFn::Last,
            _ => AggregateFn::Mean,
        }
    }

    /// Canonical string form
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFn::Mean => "mean",
            AggregateFn::Sum => "sum",
            AggregateFn::Max => "max",
            AggregateFn::Min => "min",
            AggregateFn::Count => "count",
            AggregateFn::Last => "last",
        }
    }

    /// True when the result does not depend on value order
    ///
    /// Order-independent functions may be pushed down to a storage backend
    /// that groups in SQL; `Last` must go through the engine, which sorts
    /// bucket members chronologically first.
    pub fn is_order_independent(&self) -> bool {
        !matches!(self, AggregateFn::Last)
    }

    /// Reduce a bucket's values
    ///
    /// `values` must be in chronological order for `Last` to pick the
    /// latest sample. An empty slice reduces to 0.0; the engine never
    /// produces empty buckets.
    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            AggregateFn::Mean => values.iter().sum::<f64>() / values.len() as f64,
            AggregateFn::Sum => values.iter().sum(),
            AggregateFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregateFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateFn::Count => values.len() as f64,
            AggregateFn::Last => *values.last().unwrap_or(&0.0),
        }
    }
}

// ============================================================================
// Buckets
// ============================================================================

/// One reduced time bucket
///
/// Derived on every query, never stored. Wire field names match the query
/// API: the reduced value is always serialized as `avg_value` regardless of
/// the function applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    /// Metric name this bucket belongs to
    pub name: String,

    /// Start of the bucket's window (inclusive)
    #[serde(rename = "time_bucket")]
    pub bucket_start: DateTime<Utc>,

    /// Reduced value
    #[serde(rename = "avg_value")]
    pub value: f64,

    /// Number of samples in the bucket
    #[serde(rename = "count")]
    pub sample_count: u64,
}

/// Align a millisecond timestamp to the start of its window
///
/// Uses `rem_euclid` so pre-epoch timestamps still round toward negative
/// infinity.
pub fn bucket_start_ms(timestamp_ms: i64, window: Window) -> i64 {
    let window_ms = window.duration_ms();
    timestamp_ms - timestamp_ms.rem_euclid(window_ms)
}

// ============================================================================
// Engine
// ============================================================================

/// Bucket and reduce a set of raw records
///
/// Records are grouped by `(bucket_start, name)`, each group is sorted
/// chronologically, then reduced with `function`. The result is ordered
/// ascending by bucket start, ties broken by name. Empty input produces an
/// empty vec, not an error.
pub fn aggregate(
    records: &[MetricRecord],
    window: Window,
    function: AggregateFn,
) -> Vec<AggregateBucket> {
    let mut groups: BTreeMap<(i64, &str), Vec<(i64, f64)>> = BTreeMap::new();

    for record in records {
        let ts = record.timestamp_ms();
        let bucket_ms = bucket_start_ms(ts, window);
        groups
            .entry((bucket_ms, record.name.as_str()))
            .or_default()
            .push((ts, record.value));
    }

    let mut buckets = Vec::with_capacity(groups.len());
    for ((bucket_ms, name), mut samples) in groups {
        samples.sort_by_key(|(ts, _)| *ts);

        let Some(bucket_start) = DateTime::from_timestamp_millis(bucket_ms) else {
            warn!(bucket_ms, name, "Bucket start not representable, skipping");
            continue;
        };

        let values: Vec<f64> = samples.iter().map(|(_, value)| *value).collect();
        buckets.push(AggregateBucket {
            name: name.to_string(),
            bucket_start,
            value: function.reduce(&values),
            sample_count: values.len() as u64,
        });
    }

    buckets
}

// ============================================================================
// Tests
// ============================================================================
