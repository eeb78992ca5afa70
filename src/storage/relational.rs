//! Relational store over SQLite
//!
//! One row per record in a single `metrics` table; tags travel as an
//! opaque JSON blob and are never indexed. The schema is applied on every
//! open with idempotent statements, so a fresh database file needs no
//! external tooling.
//!
//! This backend also answers aggregation in SQL for the order-independent
//! functions, grouping rows by `(timestamp_ms / window) * window`. For
//! non-negative timestamps that is the same alignment the in-process
//! engine computes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use super::{MetricStore, RawQuery};
use crate::aggregate::{AggregateBucket, AggregateFn, Window};
use crate::error::StorageError;
use crate::types::MetricRecord;

const BACKEND: &str = "relational";

const MAX_CONNECTIONS: u32 = 5;

/// Schema statements run on every open; each one is idempotent
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        value REAL NOT NULL,
        tags TEXT NOT NULL DEFAULT '{}',
        timestamp_ms INTEGER NOT NULL,
        source TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics (name, timestamp_ms)",
    "CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics (timestamp_ms)",
];

/// Metric store over a SQLite database file
#[derive(Debug, Clone)]
pub struct RelationalStore {
    db: Pool<Sqlite>,
}

impl RelationalStore {
    /// Open the database at `path`, creating file and schema as needed
    ///
    /// `:memory:` opens a private in-memory database; the pool is then
    /// pinned to one long-lived connection so every query sees the same
    /// data.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";
        if !in_memory {
            create_parent_dir(Path::new(path)).await?;
        }

        let mut options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS)
        };

        let db = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable(format!("open {path}: {e}")))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&db)
                .await
                .map_err(|e| StorageError::Unavailable(format!("schema setup: {e}")))?;
        }

        debug!(path, "Relational store ready");
        Ok(Self { db })
    }

    fn write_failed(e: sqlx::Error) -> StorageError {
        StorageError::WriteFailed {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        }
    }

    fn query_failed(e: sqlx::Error) -> StorageError {
        StorageError::QueryFailed {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl MetricStore for RelationalStore {
    fn backend_id(&self) -> &str {
        BACKEND
    }

    async fn write(&self, record: &MetricRecord) -> Result<(), StorageError> {
        let tags = serde_json::to_string(&record.tags).map_err(|e| StorageError::WriteFailed {
            backend: BACKEND.to_string(),
            reason: format!("encode tags: {e}"),
        })?;

        sqlx::query(
            "INSERT INTO metrics (name, value, tags, timestamp_ms, source) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.name)
        .bind(record.value)
        .bind(tags)
        .bind(record.timestamp_ms())
        .bind(record.source.as_deref())
        .execute(&self.db)
        .await
        .map_err(Self::write_failed)?;

        Ok(())
    }

    async fn query_raw(&self, query: &RawQuery) -> Result<Vec<MetricRecord>, StorageError> {
        let (start_ms, end_ms) = query.resolve_bounds(Utc::now())?;

        let rows = build_raw_query(query, start_ms, end_ms)
            .build()
            .fetch_all(&self.db)
            .await
            .map_err(Self::query_failed)?;

        // A corrupt row drops out of the result set, it does not take the
        // rest of the query down with it
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match extract_record(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping undecodable row"),
            }
        }
        Ok(records)
    }

    async fn query_names(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT name FROM metrics ORDER BY name")
            .fetch_all(&self.db)
            .await
            .map_err(Self::query_failed)?;

        rows.iter().map(|row| get_column(row, "name")).collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.db)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn aggregate_pushdown(
        &self,
        query: &RawQuery,
        window: Window,
        function: AggregateFn,
    ) -> Result<Option<Vec<AggregateBucket>>, StorageError> {
        let (start_ms, end_ms) = query.resolve_bounds(Utc::now())?;

        // Integer division truncates toward zero, which only matches the
        // engine's alignment for non-negative timestamps
        if start_ms < 0 {
            return Ok(None);
        }

        // GROUP BY has no per-bucket chronological order, so `last`
        // stays in-process
        if !function.is_order_independent() {
            return Ok(None);
        }

        let agg_expr = match function {
            AggregateFn::Mean => "AVG(value)",
            AggregateFn::Sum => "SUM(value)",
            AggregateFn::Max => "MAX(value)",
            AggregateFn::Min => "MIN(value)",
            AggregateFn::Count => "CAST(COUNT(*) AS REAL)",
            AggregateFn::Last => return Ok(None),
        };

        let window_ms = window.duration_ms();
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT (timestamp_ms / ");
        builder.push_bind(window_ms);
        builder.push(") * ");
        builder.push_bind(window_ms);
        builder.push(" AS bucket_ms, name, ");
        builder.push(agg_expr);
        builder.push(" AS agg_value, COUNT(*) AS sample_count FROM metrics WHERE timestamp_ms BETWEEN ");
        builder.push_bind(start_ms);
        builder.push(" AND ");
        builder.push_bind(end_ms);
        if let Some(name) = &query.name {
            builder.push(" AND name = ");
            builder.push_bind(name.as_str());
        }
        if let Some(source) = &query.source {
            builder.push(" AND source = ");
            builder.push_bind(source.as_str());
        }
        builder.push(" GROUP BY bucket_ms, name ORDER BY bucket_ms, name");

        let rows = builder
            .build()
            .fetch_all(&self.db)
            .await
            .map_err(Self::query_failed)?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in &rows {
            let bucket_ms: i64 = get_column(row, "bucket_ms")?;
            let name: String = get_column(row, "name")?;
            let value: f64 = get_column(row, "agg_value")?;
            let sample_count: i64 = get_column(row, "sample_count")?;

            let Some(bucket_start) = DateTime::from_timestamp_millis(bucket_ms) else {
                warn!(bucket_ms, "Bucket start not representable, skipping");
                continue;
            };

            buckets.push(AggregateBucket {
                name,
                bucket_start,
                value,
                sample_count: sample_count as u64,
            });
        }

        Ok(Some(buckets))
    }
}

/// Builds the filtered raw record query, newest first
fn build_raw_query<'a>(query: &'a RawQuery, start_ms: i64, end_ms: i64) -> QueryBuilder<'a, Sqlite> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT name, value, tags, timestamp_ms, source FROM metrics WHERE timestamp_ms BETWEEN ",
    );
    builder.push_bind(start_ms);
    builder.push(" AND ");
    builder.push_bind(end_ms);

    if let Some(name) = &query.name {
        builder.push(" AND name = ");
        builder.push_bind(name.as_str());
    }
    if let Some(source) = &query.source {
        builder.push(" AND source = ");
        builder.push_bind(source.as_str());
    }

    // Insertion order breaks timestamp ties so pagination stays stable
    builder.push(" ORDER BY timestamp_ms DESC, id DESC LIMIT ");
    builder.push_bind(query.limit as i64);
    builder
}

/// Reconstructs a record from a row
fn extract_record(row: &SqliteRow) -> Result<MetricRecord, StorageError> {
    let name: String = get_column(row, "name")?;
    let value: f64 = get_column(row, "value")?;
    let tags_json: String = get_column(row, "tags")?;
    let timestamp_ms: i64 = get_column(row, "timestamp_ms")?;
    let source: Option<String> = get_column(row, "source")?;

    let tags: BTreeMap<String, String> = serde_json::from_str(&tags_json)
        .map_err(|e| StorageError::CorruptRecord(format!("tags for '{name}': {e}")))?;

    let timestamp = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
        StorageError::CorruptRecord(format!(
            "record '{name}' has out-of-range timestamp {timestamp_ms}"
        ))
    })?;

    Ok(MetricRecord {
        name,
        value,
        tags,
        timestamp,
        source,
    })
}

fn get_column<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column).map_err(|e| StorageError::QueryFailed {
        backend: BACKEND.to_string(),
        reason: format!("column {column}: {e}"),
    })
}

async fn create_parent_dir(path: &Path) -> Result<(), StorageError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if !parent.as_os_str().is_empty() && !parent.exists() {
        debug!("Creating database directory: {}", parent.display());
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .create(parent)
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
    }

    Ok(())
}
