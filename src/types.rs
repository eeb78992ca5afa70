//! Core data types used throughout the metrics engine
//!
//! This module defines the record model shared by every component:
//!
//! # Key Types
//!
//! - **`RecordDraft`**: The untrusted wire shape of a metric (everything optional)
//! - **`MetricRecord`**: A validated, immutable metric record
//! - **`RESERVED_TAG_KEYS`**: Tag keys that collide with record fields
//!
//! A draft is validated exactly once, at the ingestion boundary. Everything
//! past that boundary (queue, storage, aggregation) handles `MetricRecord`
//! and can rely on its invariants: non-empty name, finite value, no reserved
//! tag keys.
//!
//! # Example
//!
//! ```rust
//! use metrond::types::RecordDraft;
//!
//! let draft = RecordDraft {
//!     name: Some("cpu_usage".to_string()),
//!     value: Some(42.5),
//!     ..Default::default()
//! };
//!
//! // Missing timestamp defaults to now, missing source to the observed origin
//! let record = draft.validate(Some("10.0.0.7")).unwrap();
//! assert_eq!(record.name, "cpu_usage");
//! assert_eq!(record.source.as_deref(), Some("10.0.0.7"));
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// Tag keys that collide with record field names
///
/// These are rejected at validation so a stored tag can never shadow the
/// `name`, `value`, `timestamp` or `source` columns of either backend.
pub const RESERVED_TAG_KEYS: &[&str] = &["name", "value", "timestamp", "source"];

/// The untrusted wire shape of a metric record
///
/// Every field is optional because producers send whatever they have; the
/// draft carries it to the validation boundary unchanged. `timestamp` stays
/// a raw string here so one malformed timestamp rejects one record instead
/// of failing deserialization of a whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordDraft {
    /// Metric name, required for promotion
    pub name: Option<String>,

    /// Metric value, required for promotion
    pub value: Option<f64>,

    /// Dimensional tags, may be empty
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// RFC 3339 / ISO-8601 timestamp; defaults to ingestion time
    pub timestamp: Option<String>,

    /// Producer-reported origin; defaults to the transport's observed origin
    pub source: Option<String>,
}

impl RecordDraft {
    /// Promote this draft to a validated record
    ///
    /// `origin` is the transport's observed origin (the client socket
    /// address at the HTTP boundary) and is used only when the draft does
    /// not name a source itself.
    ///
    /// # Validation rules
    ///
    /// - `name` must be present and non-empty
    /// - `value` must be present and finite
    /// - no tag key may be one of [`RESERVED_TAG_KEYS`]
    /// - `timestamp`, when present, must parse (missing means "now")
    ///
    /// # Example
    ///
    /// ```rust
    /// use metrond::types::RecordDraft;
    ///
    /// let draft = RecordDraft {
    ///     name: Some(String::new()),
    ///     value: Some(1.0),
    ///     ..Default::default()
    /// };
    /// assert!(draft.validate(None).is_err());
    /// ```
    pub fn validate(self, origin: Option<&str>) -> Result<MetricRecord, ValidationError> {
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            Some(_) => return Err(ValidationError::EmptyName),
            None => return Err(ValidationError::MissingField("name")),
        };

        let value = self
            .value
            .ok_or(ValidationError::MissingField("value"))?;
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue { value });
        }

        for key in self.tags.keys() {
            if RESERVED_TAG_KEYS.contains(&key.as_str()) {
                return Err(ValidationError::ReservedTagKey(key.clone()));
            }
        }

        let timestamp = match self.timestamp {
            Some(raw) => parse_timestamp(&raw)?,
            None => Utc::now(),
        };

        let source = self.source.or_else(|| origin.map(str::to_string));

        Ok(MetricRecord {
            name,
            value,
            tags: self.tags,
            timestamp,
            source,
        })
    }
}

/// A validated metric record
///
/// The unit of data flowing through the system: enqueued immutably,
/// persisted append-only, reconstructed on reads. There is no update or
/// delete path.
///
/// # Fields
///
/// - `name`: non-empty metric name (e.g. `cpu_usage`)
/// - `value`: finite IEEE 754 double
/// - `tags`: dimensional metadata, free of reserved keys
/// - `timestamp`: UTC, millisecond resolution or better
/// - `source`: reporting origin, if known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Metric name
    pub name: String,

    /// Measurement value
    pub value: f64,

    /// Dimensional tags (e.g. host=web-01, region=eu-west)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Measurement time in UTC
    pub timestamp: DateTime<Utc>,

    /// Reporting origin (agent hostname, client address)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl MetricRecord {
    /// Create a record with the given name and value, timestamped now
    ///
    /// Intended for in-process producers and tests; records arriving over
    /// the wire go through [`RecordDraft::validate`] instead.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            tags: BTreeMap::new(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Replace the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Replace the source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Measurement time as Unix milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Parse a producer-supplied timestamp
///
/// Accepts RFC 3339 (`2024-01-01T10:00:00Z`, with offset) and naive
/// ISO-8601 (`2024-01-01T10:00:00`, `2024-01-01 10:00:00.123`), treating
/// naive times as UTC.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::InvalidTimestamp {
        input: input.to_string(),
        message: "expected RFC 3339 or ISO-8601".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str, value: f64) -> RecordDraft {
        RecordDraft {
            name: Some(name.to_string()),
            value: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_fills_defaults() {
        let before = Utc::now();
        let record = draft("cpu_usage", 42.5).validate(Some("10.0.0.7")).unwrap();
        let after = Utc::now();

        assert_eq!(record.name, "cpu_usage");
        assert_eq!(record.value, 42.5);
        assert!(record.tags.is_empty());
        assert!(record.timestamp >= before && record.timestamp <= after);
        assert_eq!(record.source.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_validate_missing_name() {
        let d = RecordDraft {
            value: Some(1.0),
            ..Default::default()
        };
        assert!(matches!(
            d.validate(None),
            Err(ValidationError::MissingField("name"))
        ));
    }

    #[test]
    fn test_validate_missing_value() {
        let d = RecordDraft {
            name: Some("cpu_usage".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            d.validate(None),
            Err(ValidationError::MissingField("value"))
        ));
    }

    #[test]
    fn test_validate_empty_name() {
        let d = RecordDraft {
            name: Some(String::new()),
            value: Some(1.0),
            ..Default::default()
        };
        assert!(matches!(d.validate(None), Err(ValidationError::EmptyName)));
    }

    #[test]
    fn test_validate_non_finite_value() {
        let d = RecordDraft {
            name: Some("cpu_usage".to_string()),
            value: Some(f64::NAN),
            ..Default::default()
        };
        assert!(matches!(
            d.validate(None),
            Err(ValidationError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn test_validate_reserved_tag_key() {
        for reserved in RESERVED_TAG_KEYS {
            let mut d = draft("cpu_usage", 1.0);
            d.tags.insert(reserved.to_string(), "x".to_string());
            assert!(
                matches!(d.validate(None), Err(ValidationError::ReservedTagKey(k)) if k == *reserved)
            );
        }
    }

    #[test]
    fn test_validate_explicit_source_wins() {
        let mut d = draft("cpu_usage", 1.0);
        d.source = Some("agent-7".to_string());
        let record = d.validate(Some("10.0.0.7")).unwrap();
        assert_eq!(record.source.as_deref(), Some("agent-7"));
    }

    #[test]
    fn test_validate_no_source_no_origin() {
        let record = draft("cpu_usage", 1.0).validate(None).unwrap();
        assert_eq!(record.source, None);
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        for input in [
            "2023-11-14T22:13:20Z",
            "2023-11-14T22:13:20+00:00",
            "2023-11-14T23:13:20+01:00",
            "2023-11-14T22:13:20",
            "2023-11-14 22:13:20",
        ] {
            let mut d = draft("cpu_usage", 1.0);
            d.timestamp = Some(input.to_string());
            let record = d.validate(None).unwrap();
            assert_eq!(record.timestamp, expected, "input: {}", input);
        }
    }

    #[test]
    fn test_timestamp_fractional_seconds() {
        let mut d = draft("cpu_usage", 1.0);
        d.timestamp = Some("2023-11-14T22:13:20.250Z".to_string());
        let record = d.validate(None).unwrap();
        assert_eq!(record.timestamp_ms(), 1_700_000_000_250);
    }

    #[test]
    fn test_timestamp_malformed() {
        let mut d = draft("cpu_usage", 1.0);
        d.timestamp = Some("next tuesday".to_string());
        assert!(matches!(
            d.validate(None),
            Err(ValidationError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_record_builder_helpers() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let record = MetricRecord::new("requests_total", 3.0)
            .with_timestamp(ts)
            .with_source("web-01")
            .with_tag("region", "eu-west");

        assert_eq!(record.timestamp_ms(), 1_700_000_000_000);
        assert_eq!(record.source.as_deref(), Some("web-01"));
        assert_eq!(record.tags.get("region").map(String::as_str), Some("eu-west"));
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = MetricRecord::new("cpu_usage", 42.5)
            .with_timestamp(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap())
            .with_tag("host", "web-01");

        let json = serde_json::to_string(&record).unwrap();
        let back: MetricRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
