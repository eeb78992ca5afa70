//! Tagged time-series store over Redis sorted sets
//!
//! Layout under the configured key prefix:
//!
//! - `{prefix}:series:{name}`: one sorted set per metric name, score is the
//!   measurement time in Unix milliseconds, member is the JSON column map
//!   of the point
//! - `{prefix}:names`: registry of known names, score is the last write
//!   time in Unix milliseconds
//!
//! A point's column map holds the user tags next to physical columns
//! (`_measurement`, `_field`, `_value`, `_time`, `source`). Reads strip
//! `_`-prefixed columns, the bookkeeping columns `result` and `table`, and
//! empty keys; the remaining columns come back as tags.
//!
//! Column maps serialize with sorted keys, so a record re-delivered by the
//! queue encodes to the identical member and collapses into the same point.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use super::{MetricStore, RawQuery};
use crate::error::{QueueError, StorageError};
use crate::redis::RedisPool;
use crate::types::MetricRecord;

const BACKEND: &str = "tagged";

/// Physical column carrying the metric name inside the member
const MEASUREMENT_COLUMN: &str = "_measurement";

/// Physical column naming the stored field
const FIELD_COLUMN: &str = "_field";

/// Physical column carrying the measurement value
const VALUE_COLUMN: &str = "_value";

/// Physical column duplicating the score, keeps same-content points at
/// different times distinct members
const TIME_COLUMN: &str = "_time";

/// Physical column carrying the reporting origin
const SOURCE_COLUMN: &str = "source";

/// The single field name this store writes
const VALUE_FIELD_NAME: &str = "value";

/// Bookkeeping columns some writers leave behind, never returned as tags
const DROPPED_COLUMNS: &[&str] = &["result", "table"];

/// How far back the names registry scan reaches
const NAMES_LOOKBACK_DAYS: i64 = 30;

/// Metric store over Redis sorted sets
///
/// Writes go through the shared [`RedisPool`] and inherit its retry and
/// timeout behavior. Time range queries run per series with the range
/// pushed to the server; a source filter is applied after decoding.
pub struct TaggedStore {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl TaggedStore {
    /// Create a store over an existing pool
    pub fn new(pool: Arc<RedisPool>, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: key_prefix.into(),
        }
    }

    fn series_key(&self, name: &str) -> String {
        format!("{}:series:{}", self.prefix, name)
    }

    fn names_key(&self) -> String {
        format!("{}:names", self.prefix)
    }

    fn query_failed(e: QueueError) -> StorageError {
        StorageError::QueryFailed {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        }
    }

    /// Names with a write at or after `since_ms`
    ///
    /// The registry scores each name by its last write, so any series with
    /// a point inside a queried range scores at or above the range start.
    async fn active_names(&self, since_ms: i64) -> Result<Vec<String>, StorageError> {
        let key = self.names_key();

        self.pool
            .execute(|mut conn| {
                let key = key.clone();
                async move { conn.zrangebyscore(&key, since_ms, "+inf").await }
            })
            .await
            .map_err(Self::query_failed)
    }

    /// Fetch one series newest first, decode, and apply the source filter
    async fn fetch_series(
        &self,
        name: &str,
        start_ms: i64,
        end_ms: i64,
        query: &RawQuery,
    ) -> Result<Vec<MetricRecord>, StorageError> {
        let key = self.series_key(name);

        // The server-side cap is only safe when every fetched point is
        // returned; a source filter means decoding the full window.
        let fetch_count = if query.source.is_none() {
            Some(query.limit as isize)
        } else {
            None
        };

        let rows: Vec<(String, i64)> = self
            .pool
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    match fetch_count {
                        Some(count) => {
                            conn.zrevrangebyscore_limit_withscores(&key, end_ms, start_ms, 0, count)
                                .await
                        }
                        None => conn.zrevrangebyscore_withscores(&key, end_ms, start_ms).await,
                    }
                }
            })
            .await
            .map_err(Self::query_failed)?;

        let mut records = Vec::with_capacity(rows.len());
        for (member, score_ms) in rows {
            // An undecodable point drops out of the result set, it does not
            // take the rest of the series down with it
            let record = match decode_point(name, &member, score_ms) {
                Ok(record) => record,
                Err(e) => {
                    warn!(series = name, error = %e, "Skipping undecodable point");
                    continue;
                }
            };
            if let Some(source) = &query.source {
                if record.source.as_deref() != Some(source.as_str()) {
                    continue;
                }
            }
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl MetricStore for TaggedStore {
    fn backend_id(&self) -> &str {
        BACKEND
    }

    async fn write(&self, record: &MetricRecord) -> Result<(), StorageError> {
        let member = encode_point(record).map_err(|e| StorageError::WriteFailed {
            backend: BACKEND.to_string(),
            reason: format!("encode: {e}"),
        })?;
        let ts_ms = record.timestamp_ms();
        let series_key = self.series_key(&record.name);
        let names_key = self.names_key();
        let name = record.name.clone();

        self.pool
            .execute(|mut conn| {
                let member = member.clone();
                let series_key = series_key.clone();
                let names_key = names_key.clone();
                let name = name.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.zadd(&series_key, &member, ts_ms).ignore();
                    // GT keeps the registry score at the latest write time
                    pipe.cmd("ZADD")
                        .arg(&names_key)
                        .arg("GT")
                        .arg(ts_ms)
                        .arg(&name)
                        .ignore();
                    pipe.query_async::<()>(&mut conn).await
                }
            })
            .await
            .map_err(|e| StorageError::WriteFailed {
                backend: BACKEND.to_string(),
                reason: e.to_string(),
            })
    }

    async fn query_raw(&self, query: &RawQuery) -> Result<Vec<MetricRecord>, StorageError> {
        let (start_ms, end_ms) = query.resolve_bounds(Utc::now())?;

        let names = match &query.name {
            Some(name) => vec![name.clone()],
            None => self.active_names(start_ms).await?,
        };

        let mut records = Vec::new();
        for name in &names {
            records.extend(self.fetch_series(name, start_ms, end_ms, query).await?);
        }

        // Newest first across all series, name breaks ties
        records.sort_by(|a, b| {
            b.timestamp_ms()
                .cmp(&a.timestamp_ms())
                .then_with(|| a.name.cmp(&b.name))
        });
        records.truncate(query.limit);
        Ok(records)
    }

    async fn query_names(&self) -> Result<Vec<String>, StorageError> {
        let cutoff_ms = (Utc::now() - Duration::days(NAMES_LOOKBACK_DAYS)).timestamp_millis();
        let mut names = self.active_names(cutoff_ms).await?;

        // Registry scan comes back in score order
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.pool
            .ping()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

/// Encode a record as the JSON column map stored in the series member
fn encode_point(record: &MetricRecord) -> serde_json::Result<String> {
    let mut columns: BTreeMap<&str, serde_json::Value> = BTreeMap::new();

    for (key, value) in &record.tags {
        columns.insert(key, serde_json::Value::String(value.clone()));
    }
    columns.insert(MEASUREMENT_COLUMN, record.name.clone().into());
    columns.insert(FIELD_COLUMN, VALUE_FIELD_NAME.into());
    columns.insert(VALUE_COLUMN, record.value.into());
    columns.insert(TIME_COLUMN, record.timestamp_ms().into());
    if let Some(source) = &record.source {
        columns.insert(SOURCE_COLUMN, source.clone().into());
    }

    serde_json::to_string(&columns)
}

/// Reconstruct a record from a series member and its score
///
/// Strips physical and bookkeeping columns from the tag set; a column map
/// without a numeric value column is a corrupt record.
fn decode_point(
    name: &str,
    member: &str,
    timestamp_ms: i64,
) -> Result<MetricRecord, StorageError> {
    let columns: BTreeMap<String, serde_json::Value> = serde_json::from_str(member)
        .map_err(|e| StorageError::CorruptRecord(format!("point in series '{name}': {e}")))?;

    let value = columns
        .get(VALUE_COLUMN)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| {
            StorageError::CorruptRecord(format!(
                "point in series '{name}' has no numeric {VALUE_COLUMN} column"
            ))
        })?;

    let timestamp = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
        StorageError::CorruptRecord(format!(
            "point in series '{name}' has out-of-range timestamp {timestamp_ms}"
        ))
    })?;

    let source = columns
        .get(SOURCE_COLUMN)
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut tags = BTreeMap::new();
    for (key, val) in &columns {
        if key.is_empty()
            || key.starts_with('_')
            || key == SOURCE_COLUMN
            || DROPPED_COLUMNS.contains(&key.as_str())
        {
            continue;
        }
        let tag_value = match val {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        tags.insert(key.clone(), tag_value);
    }

    Ok(MetricRecord {
        name: name.to_string(),
        value,
        tags,
        timestamp,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> MetricRecord {
        MetricRecord::new("cpu_usage", 42.5)
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap())
            .with_tag("host", "web-01")
            .with_tag("region", "eu-west")
            .with_source("agent-1")
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let record = sample_record();
        let member = encode_point(&record).unwrap();
        let decoded = decode_point("cpu_usage", &member, record.timestamp_ms()).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let record = sample_record();
        assert_eq!(
            encode_point(&record).unwrap(),
            encode_point(&record.clone()).unwrap()
        );
    }

    #[test]
    fn test_decode_strips_physical_columns() {
        let member = r#"{
            "_field": "value",
            "_measurement": "cpu_usage",
            "_start": "2024-01-01T00:00:00Z",
            "_stop": "2024-01-02T00:00:00Z",
            "_time": 1704103200000,
            "_value": 42.5,
            "result": "_result",
            "table": "0",
            "": "ghost",
            "host": "web-01"
        }"#;

        let record = decode_point("cpu_usage", member, 1_704_103_200_000).unwrap();
        assert_eq!(record.value, 42.5);
        assert_eq!(record.tags.len(), 1);
        assert_eq!(record.tags.get("host").map(String::as_str), Some("web-01"));
    }

    #[test]
    fn test_decode_source_column_is_not_a_tag() {
        let record = sample_record();
        let member = encode_point(&record).unwrap();
        let decoded = decode_point("cpu_usage", &member, record.timestamp_ms()).unwrap();

        assert_eq!(decoded.source.as_deref(), Some("agent-1"));
        assert!(!decoded.tags.contains_key("source"));
    }

    #[test]
    fn test_decode_foreign_scalar_tag_becomes_string() {
        let member = r#"{"_value": 1.0, "replica": 3}"#;
        let record = decode_point("queue_depth", member, 1_704_103_200_000).unwrap();
        assert_eq!(record.tags.get("replica").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_decode_missing_value_is_corrupt() {
        let member = r#"{"_measurement": "cpu_usage", "host": "web-01"}"#;
        let err = decode_point("cpu_usage", member, 1_704_103_200_000).unwrap_err();
        assert!(matches!(err, StorageError::CorruptRecord(_)));
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        let err = decode_point("cpu_usage", "not json", 1_704_103_200_000).unwrap_err();
        assert!(matches!(err, StorageError::CorruptRecord(_)));
    }
}
