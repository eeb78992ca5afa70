//! Relational Store Integration Tests
//!
//! Exercises the full write-then-query path against SQLite, mostly
//! in-memory with one file-backed reopen check.
//!
//! # Test Coverage
//!
//! 1. **Round Trip** - Written records come back intact
//! 2. **Filters** - Name, source, and inclusive time bounds
//! 3. **Ordering** - Newest first, limit respected
//! 4. **Names** - Distinct metric names, ascending
//! 5. **Idempotence** - Repeating a query returns identical results
//! 6. **Pushdown Parity** - SQL aggregation matches the in-process engine
//! 7. **Durability** - A file-backed store survives reopening

use chrono::{DateTime, Duration, TimeZone, Utc};
use metrond::aggregate::{aggregate, AggregateFn, Window};
use metrond::error::StorageError;
use metrond::storage::{MetricStore, RawQuery, RelationalStore};
use metrond::types::MetricRecord;

// =============================================================================
// Test Helpers
// =============================================================================

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

/// Three hours of data across two metric families
///
/// `cpu_percent`: 36 points at 5 minute spacing, alternating between two
/// hosts. `request_latency_ms`: 12 points at 15 minute spacing from one
/// host. Values are small integers so SQL and in-process float arithmetic
/// agree exactly.
fn sample_records(base: DateTime<Utc>) -> Vec<MetricRecord> {
    let mut records = Vec::new();

    for i in 0..36 {
        let host = if i % 2 == 0 { "web-01" } else { "web-02" };
        records.push(
            MetricRecord::new("cpu_percent", 10.0 + i as f64)
                .with_timestamp(base + Duration::minutes(5 * i))
                .with_source(host)
                .with_tag("host", host),
        );
    }

    for i in 0..12 {
        records.push(
            MetricRecord::new("request_latency_ms", 50.0 + 5.0 * i as f64)
                .with_timestamp(base + Duration::minutes(15 * i))
                .with_source("web-01")
                .with_tag("route", "/api/checkout"),
        );
    }

    records
}

/// In-memory store preloaded with the sample data
async fn seeded_store() -> RelationalStore {
    let store = RelationalStore::open(":memory:")
        .await
        .expect("Failed to open in-memory store");

    for record in sample_records(base_time()) {
        store.write(&record).await.expect("Failed to write record");
    }

    store
}

/// Query spanning the whole sample window with room to spare
fn full_range_query() -> RawQuery {
    RawQuery::default()
        .with_start(base_time())
        .with_end(base_time() + Duration::hours(3))
        .with_limit(10_000)
}

// =============================================================================
// Round Trip and Filters
// =============================================================================

#[tokio::test]
async fn test_write_then_query_round_trip() {
    let store = RelationalStore::open(":memory:")
        .await
        .expect("Failed to open in-memory store");

    let record = MetricRecord::new("disk_used_gb", 118.5)
        .with_timestamp(base_time())
        .with_source("db-01")
        .with_tag("mount", "/var/lib")
        .with_tag("fs", "ext4");
    store.write(&record).await.expect("Failed to write record");

    let results = store
        .query_raw(&full_range_query().with_name("disk_used_gb"))
        .await
        .expect("Query failed");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0], record);
}

#[tokio::test]
async fn test_query_filters_by_name_and_source() {
    let store = seeded_store().await;

    let results = store
        .query_raw(
            &full_range_query()
                .with_name("cpu_percent")
                .with_source("web-02"),
        )
        .await
        .expect("Query failed");

    // Odd-numbered cpu samples landed on web-02
    assert_eq!(results.len(), 18);
    for record in &results {
        assert_eq!(record.name, "cpu_percent");
        assert_eq!(record.source.as_deref(), Some("web-02"));
    }
}

#[tokio::test]
async fn test_query_time_bounds_are_inclusive() {
    let store = seeded_store().await;
    let start = base_time() + Duration::minutes(10);
    let end = base_time() + Duration::minutes(30);

    let all = store
        .query_raw(&RawQuery::default().with_start(start).with_end(end))
        .await
        .expect("Query failed");
    // cpu at 10/15/20/25/30, latency at 15/30
    assert_eq!(all.len(), 7);

    let cpu_only = store
        .query_raw(
            &RawQuery::default()
                .with_name("cpu_percent")
                .with_start(start)
                .with_end(end),
        )
        .await
        .expect("Query failed");
    assert_eq!(cpu_only.len(), 5);
}

#[tokio::test]
async fn test_query_newest_first_with_limit() {
    let store = seeded_store().await;

    let results = store
        .query_raw(&full_range_query().with_limit(5))
        .await
        .expect("Query failed");

    assert_eq!(results.len(), 5);
    for pair in results.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }
    // Latest sample overall is the final cpu point
    assert_eq!(results[0].name, "cpu_percent");
    assert_eq!(results[0].timestamp, base_time() + Duration::minutes(175));
}

#[tokio::test]
async fn test_repeated_query_returns_identical_results() {
    let store = seeded_store().await;
    let query = full_range_query().with_name("cpu_percent");

    let first = store.query_raw(&query).await.expect("First query failed");
    let second = store.query_raw(&query).await.expect("Second query failed");

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_duplicate_writes_are_kept() {
    let store = RelationalStore::open(":memory:")
        .await
        .expect("Failed to open in-memory store");

    let record = MetricRecord::new("page_clicks", 1.0).with_timestamp(base_time());
    store.write(&record).await.expect("First write failed");
    store.write(&record).await.expect("Second write failed");

    let results = store
        .query_raw(&full_range_query().with_name("page_clicks"))
        .await
        .expect("Query failed");
    // Redelivered records are stored again, not deduplicated
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_inverted_range_rejected() {
    let store = seeded_store().await;

    let err = store
        .query_raw(
            &RawQuery::default()
                .with_start(base_time() + Duration::hours(2))
                .with_end(base_time()),
        )
        .await
        .expect_err("Inverted range should fail");

    assert!(matches!(err, StorageError::InvalidTimeRange { .. }));
}

// =============================================================================
// Names and Health
// =============================================================================

#[tokio::test]
async fn test_query_names_sorted_distinct() {
    let store = seeded_store().await;

    let names = store.query_names().await.expect("Name query failed");
    assert_eq!(names, vec!["cpu_percent", "request_latency_ms"]);
}

#[tokio::test]
async fn test_query_names_deduplicates_heavy_repetition() {
    let store = RelationalStore::open(":memory:")
        .await
        .expect("Failed to open in-memory store");

    for i in 0..1000 {
        let record = MetricRecord::new("dup_metric", i as f64)
            .with_timestamp(base_time() + Duration::seconds(i));
        store.write(&record).await.expect("Failed to write record");
    }
    let other = MetricRecord::new("alpha_metric", 1.0).with_timestamp(base_time());
    store.write(&other).await.expect("Failed to write record");

    let names = store.query_names().await.expect("Name query failed");
    assert_eq!(names, vec!["alpha_metric", "dup_metric"]);
}

#[tokio::test]
async fn test_ping() {
    let store = seeded_store().await;
    store.ping().await.expect("Ping failed");
}

// =============================================================================
// Aggregation Pushdown Parity
// =============================================================================

#[tokio::test]
async fn test_pushdown_matches_engine() {
    let store = seeded_store().await;
    let query = full_range_query();
    let raw = store.query_raw(&query).await.expect("Raw query failed");

    for window in [
        Window::OneMinute,
        Window::FiveMinutes,
        Window::OneHour,
        Window::OneDay,
    ] {
        for function in [
            AggregateFn::Mean,
            AggregateFn::Sum,
            AggregateFn::Max,
            AggregateFn::Min,
            AggregateFn::Count,
        ] {
            let pushed = store
                .aggregate_pushdown(&query, window, function)
                .await
                .expect("Pushdown failed")
                .expect("Relational store should push this down");
            let engine = aggregate(&raw, window, function);
            assert_eq!(pushed, engine, "window {window:?} function {function:?}");
        }
    }
}

#[tokio::test]
async fn test_pushdown_honors_filters() {
    let store = seeded_store().await;
    let query = full_range_query()
        .with_name("cpu_percent")
        .with_source("web-01");
    let raw = store.query_raw(&query).await.expect("Raw query failed");

    let pushed = store
        .aggregate_pushdown(&query, Window::OneHour, AggregateFn::Mean)
        .await
        .expect("Pushdown failed")
        .expect("Relational store should push this down");

    assert_eq!(pushed, aggregate(&raw, Window::OneHour, AggregateFn::Mean));
    assert!(pushed.iter().all(|b| b.name == "cpu_percent"));
}

#[tokio::test]
async fn test_last_stays_in_process() {
    let store = seeded_store().await;
    let query = full_range_query();

    let pushed = store
        .aggregate_pushdown(&query, Window::OneHour, AggregateFn::Last)
        .await
        .expect("Pushdown failed");
    assert!(pushed.is_none());

    // The engine covers it instead: 3 hourly buckets per metric name
    let raw = store.query_raw(&query).await.expect("Raw query failed");
    let buckets = aggregate(&raw, Window::OneHour, AggregateFn::Last);
    assert_eq!(buckets.len(), 6);

    // Latency hour 0 holds 50/55/60/65, chronologically last is 65
    let latency_first_hour = buckets
        .iter()
        .find(|b| b.name == "request_latency_ms" && b.bucket_start == base_time())
        .expect("Missing latency bucket");
    assert_eq!(latency_first_hour.value, 65.0);
    assert_eq!(latency_first_hour.sample_count, 4);
}

// =============================================================================
// File-Backed Durability
// =============================================================================

#[tokio::test]
async fn test_reopen_file_backed_store() {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("metrics.db");
    let path = path.to_str().expect("Temp path not UTF-8");

    {
        let store = RelationalStore::open(path)
            .await
            .expect("Failed to open file-backed store");
        for record in sample_records(base_time()).into_iter().take(3) {
            store.write(&record).await.expect("Failed to write record");
        }
    }

    // Schema bootstrap is idempotent and earlier writes are still there
    let store = RelationalStore::open(path)
        .await
        .expect("Failed to reopen store");
    let results = store
        .query_raw(&full_range_query())
        .await
        .expect("Query failed");
    assert_eq!(results.len(), 3);
}
