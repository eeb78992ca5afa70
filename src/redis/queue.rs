//! Durable ingestion queue over a Redis stream
//!
//! Carries validated records from producers to storage writers with
//! at-least-once delivery:
//!
//! ```text
//! Redis Schema:
//! {stream}           → STREAM, one entry per record: {payload: <record JSON>}
//! group {group}      → consumer group tracking pending deliveries per writer
//! ```
//!
//! A producer enqueues with XADD; an acknowledged XADD means the record is
//! on the stream, durably queued but not yet queryable. Writers read through
//! the consumer group (XREADGROUP), acknowledge after a successful storage
//! write (XACK), and periodically reclaim deliveries whose writer died
//! mid-write (XAUTOCLAIM). A delivery that is never acked is redelivered, so
//! a crash between write and ack can duplicate a record; consumers must
//! tolerate that.
//!
//! Entries whose payload cannot be decoded are acked and dropped with an
//! error log so a poison entry cannot wedge the group.

use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::RedisPool;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::types::MetricRecord;

/// Field carrying the record JSON in each stream entry
const PAYLOAD_FIELD: &str = "payload";

/// Identifier of an enqueued delivery (the stream entry id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unacknowledged delivery handed to a writer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Id to acknowledge once the record is persisted
    pub id: DeliveryId,
    /// The decoded record
    pub record: MetricRecord,
}

/// Producer handle for the ingestion queue
pub struct IngestQueue {
    pool: Arc<RedisPool>,
    config: QueueConfig,
}

impl IngestQueue {
    /// Create a producer for the configured stream
    pub fn new(pool: Arc<RedisPool>, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Enqueue one validated record
    ///
    /// Ok means the record is on the stream. A retried XADD after an
    /// ambiguous failure can enqueue the record twice, which is within the
    /// at-least-once contract.
    pub async fn enqueue(&self, record: &MetricRecord) -> Result<DeliveryId, QueueError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| QueueError::EnqueueFailed(format!("serialize record: {}", e)))?;

        let id: String = self
            .pool
            .execute(|mut conn| {
                let stream = self.config.stream.clone();
                let payload = payload.clone();
                async move {
                    conn.xadd(&stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
                        .await
                }
            })
            .await?;

        debug!(id = %id, name = %record.name, "Record enqueued");
        Ok(DeliveryId(id))
    }
}

/// Consumer handle for the ingestion queue
///
/// Each instance registers under a unique consumer name; any number of
/// consumers share the group and the stream is partitioned between them.
pub struct QueueConsumer {
    pool: Arc<RedisPool>,
    config: QueueConfig,
    consumer_name: String,
}

impl QueueConsumer {
    /// Create a consumer and ensure the group exists
    pub async fn new(pool: Arc<RedisPool>, config: QueueConfig) -> Result<Self, QueueError> {
        let consumer = Self {
            pool,
            config,
            consumer_name: format!("writer-{}", Uuid::new_v4()),
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// The unique consumer name registered with the group
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Create the consumer group, tolerating one that already exists
    async fn ensure_group(&self) -> Result<(), QueueError> {
        let created: bool = self
            .pool
            .execute(|mut conn| {
                let stream = self.config.stream.clone();
                let group = self.config.group.clone();
                async move {
                    let result = redis::cmd("XGROUP")
                        .arg("CREATE")
                        .arg(&stream)
                        .arg(&group)
                        .arg("0")
                        .arg("MKSTREAM")
                        .query_async::<()>(&mut conn)
                        .await;
                    match result {
                        Ok(()) => Ok(true),
                        Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;

        if created {
            debug!(
                stream = %self.config.stream,
                group = %self.config.group,
                "Consumer group created"
            );
        }
        Ok(())
    }

    /// Block for up to the configured interval and return new deliveries
    ///
    /// Returns an empty vec on an idle stream. Poison entries are acked
    /// and dropped here, never surfaced to the writer.
    pub async fn next_batch(&self) -> Result<Vec<Delivery>, QueueError> {
        // The command legitimately takes block_timeout on an idle stream,
        // so its budget must exceed the block interval
        let budget =
            Duration::from_millis(self.config.block_timeout_ms) + self.pool.command_timeout();

        let reply: Option<StreamReadReply> = self
            .pool
            .execute_with_timeout(budget, |mut conn| {
                let stream = self.config.stream.clone();
                let opts = StreamReadOptions::default()
                    .group(self.config.group.clone(), self.consumer_name.clone())
                    .count(self.config.batch_size)
                    .block(self.config.block_timeout_ms as usize);
                async move {
                    match conn.xread_options(&[&stream], &[">"], &opts).await {
                        Ok(reply) => Ok(Some(reply)),
                        Err(e) if e.code() == Some("NOGROUP") => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;

        let Some(reply) = reply else {
            warn!(group = %self.config.group, "Consumer group missing, recreating");
            self.ensure_group().await?;
            return Ok(Vec::new());
        };

        let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|key| key.ids).collect();
        self.decode_entries(entries).await
    }

    /// Acknowledge a processed delivery
    ///
    /// Dropping the ack (crash after write) is safe: the delivery is
    /// redelivered and the record written again.
    pub async fn ack(&self, id: &DeliveryId) -> Result<(), QueueError> {
        let acked: i64 = self
            .pool
            .execute(|mut conn| {
                let stream = self.config.stream.clone();
                let group = self.config.group.clone();
                let entry = id.0.clone();
                async move { conn.xack(&stream, &group, &[&entry]).await }
            })
            .await
            .map_err(|e| QueueError::AckFailed {
                id: id.0.clone(),
                reason: e.to_string(),
            })?;

        if acked == 0 {
            debug!(id = %id, "Ack for unknown or already-acked delivery");
        }
        Ok(())
    }

    /// Claim deliveries whose consumer has been idle past the threshold
    ///
    /// Run periodically by writers so records owned by a dead writer are
    /// not stranded in its pending list.
    pub async fn reclaim_stale(&self) -> Result<Vec<Delivery>, QueueError> {
        let reply: StreamAutoClaimReply = self
            .pool
            .execute(|mut conn| {
                let stream = self.config.stream.clone();
                let group = self.config.group.clone();
                let consumer = self.consumer_name.clone();
                let min_idle = self.config.claim_idle_ms;
                let opts = StreamAutoClaimOptions::default().count(self.config.batch_size);
                async move {
                    conn.xautoclaim_options(&stream, &group, &consumer, min_idle, "0-0", opts)
                        .await
                }
            })
            .await?;

        if !reply.claimed.is_empty() {
            debug!(
                count = reply.claimed.len(),
                consumer = %self.consumer_name,
                "Reclaimed stale deliveries"
            );
        }
        self.decode_entries(reply.claimed).await
    }

    /// Decode stream entries, acking and dropping any poison entry
    async fn decode_entries(&self, entries: Vec<StreamId>) -> Result<Vec<Delivery>, QueueError> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry(&entry) {
                Ok(record) => deliveries.push(Delivery {
                    id: DeliveryId(entry.id.clone()),
                    record,
                }),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable queue entry");
                    self.ack(&DeliveryId(entry.id.clone())).await?;
                }
            }
        }
        Ok(deliveries)
    }
}

/// Decode the record payload of one stream entry
fn decode_entry(entry: &StreamId) -> Result<MetricRecord, QueueError> {
    let payload: String = entry
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| QueueError::DecodeFailed {
            id: entry.id.clone(),
            reason: "missing payload field".to_string(),
        })?;

    serde_json::from_str(&payload).map_err(|e| QueueError::DecodeFailed {
        id: entry.id.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn stream_entry(id: &str, payload: Option<&str>) -> StreamId {
        let mut entry = StreamId {
            id: id.to_string(),
            map: Default::default(),
        };
        if let Some(p) = payload {
            entry.map.insert(
                PAYLOAD_FIELD.to_string(),
                redis::Value::BulkString(p.as_bytes().to_vec()),
            );
        }
        entry
    }

    #[test]
    fn test_decode_entry_round_trip() {
        let record = MetricRecord::new("cpu_usage", 42.5)
            .with_timestamp(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap())
            .with_source("web-01")
            .with_tag("region", "eu-west");
        let payload = serde_json::to_string(&record).unwrap();

        let decoded = decode_entry(&stream_entry("1-0", Some(&payload))).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_entry_missing_payload() {
        let err = decode_entry(&stream_entry("1-0", None)).unwrap_err();
        assert!(matches!(err, QueueError::DecodeFailed { id, .. } if id == "1-0"));
    }

    #[test]
    fn test_decode_entry_bad_json() {
        let err = decode_entry(&stream_entry("2-0", Some("{not json"))).unwrap_err();
        assert!(matches!(err, QueueError::DecodeFailed { .. }));
    }

    #[test]
    fn test_delivery_id_display() {
        assert_eq!(DeliveryId("1712-0".to_string()).to_string(), "1712-0");
    }
}
