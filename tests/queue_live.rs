//! Live Redis Integration Tests
//!
//! Run against a real Redis with `cargo test -- --ignored`. Each test works
//! under uniquely named keys and deletes them afterwards, so runs do not
//! interfere with each other or with a deployed pipeline.
//!
//! The target comes from `METROND_TEST_REDIS_URL`, defaulting to
//! `redis://127.0.0.1:6379/0`.
//!
//! # Test Coverage
//!
//! 1. **Delivery Cycle** - Enqueue, consume, acknowledge, drain
//! 2. **Reclaim** - A dead consumer's pending deliveries move on
//! 3. **Pipeline** - The writer loop drains the queue into a store
//! 4. **Tagged Store** - Write and query through Redis sorted sets

use chrono::{Duration, Utc};
use metrond::config::{QueueConfig, RedisConfig};
use metrond::redis::{IngestQueue, QueueConsumer, RedisPool};
use metrond::storage::{MetricStore, RawQuery, RelationalStore, TaggedStore};
use metrond::types::MetricRecord;
use metrond::writer::Writer;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

// =============================================================================
// Test Helpers
// =============================================================================

fn test_redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("METROND_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),
        ..RedisConfig::default()
    }
}

/// Short timeouts and a unique stream so tests stay fast and isolated
fn test_queue_config(label: &str) -> QueueConfig {
    QueueConfig {
        stream: format!("metrond:test:{}:{}", label, Uuid::new_v4()),
        group: "metrond-test-writers".to_string(),
        block_timeout_ms: 500,
        batch_size: 10,
        claim_idle_ms: 100,
        reclaim_interval_ms: 1000,
    }
}

async fn test_pool() -> Arc<RedisPool> {
    Arc::new(
        RedisPool::new(&test_redis_config())
            .await
            .expect("Failed to create Redis pool"),
    )
}

/// Remove the keys a test created
async fn cleanup_keys(pool: &RedisPool, keys: Vec<String>) {
    let _ = pool
        .execute(|mut conn| {
            let keys = keys.clone();
            async move { redis::cmd("DEL").arg(&keys).query_async::<i64>(&mut conn).await }
        })
        .await;
}

// =============================================================================
// Delivery Cycle
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_enqueue_consume_ack_cycle() {
    let pool = test_pool().await;
    let config = test_queue_config("cycle");

    let queue = IngestQueue::new(Arc::clone(&pool), config.clone());
    let consumer = QueueConsumer::new(Arc::clone(&pool), config.clone())
        .await
        .expect("Failed to register consumer");

    let record = MetricRecord::new("live_cycle", 42.0)
        .with_source("itest")
        .with_tag("suite", "queue_live");
    let delivery_id = queue.enqueue(&record).await.expect("Enqueue failed");

    let batch = consumer.next_batch().await.expect("Read failed");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, delivery_id);
    assert_eq!(batch[0].record, record);

    consumer.ack(&batch[0].id).await.expect("Ack failed");

    // Nothing left; the next blocking read comes back empty
    let empty = consumer.next_batch().await.expect("Read failed");
    assert!(empty.is_empty());

    cleanup_keys(&pool, vec![config.stream.clone()]).await;
}

#[tokio::test]
#[ignore]
async fn test_batch_enqueue_preserves_order() {
    let pool = test_pool().await;
    let config = test_queue_config("order");

    let queue = IngestQueue::new(Arc::clone(&pool), config.clone());
    let consumer = QueueConsumer::new(Arc::clone(&pool), config.clone())
        .await
        .expect("Failed to register consumer");

    for i in 0..5 {
        let record = MetricRecord::new("live_order", i as f64);
        queue.enqueue(&record).await.expect("Enqueue failed");
    }

    let batch = consumer.next_batch().await.expect("Read failed");
    assert_eq!(batch.len(), 5);
    // Stream entry ids are monotonic, deliveries arrive in enqueue order
    for (i, delivery) in batch.iter().enumerate() {
        assert_eq!(delivery.record.value, i as f64);
    }

    for delivery in &batch {
        consumer.ack(&delivery.id).await.expect("Ack failed");
    }

    cleanup_keys(&pool, vec![config.stream.clone()]).await;
}

// =============================================================================
// Reclaim
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_reclaim_from_dead_consumer() {
    let pool = test_pool().await;
    let config = test_queue_config("reclaim");

    let queue = IngestQueue::new(Arc::clone(&pool), config.clone());
    let dead = QueueConsumer::new(Arc::clone(&pool), config.clone())
        .await
        .expect("Failed to register consumer");

    let record = MetricRecord::new("live_reclaim", 7.0);
    queue.enqueue(&record).await.expect("Enqueue failed");

    // Deliver to the first consumer, then lose it before the ack
    let batch = dead.next_batch().await.expect("Read failed");
    assert_eq!(batch.len(), 1);
    drop(dead);

    // Exceed claim_idle_ms so the delivery counts as stale
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let survivor = QueueConsumer::new(Arc::clone(&pool), config.clone())
        .await
        .expect("Failed to register consumer");
    let reclaimed = survivor.reclaim_stale().await.expect("Reclaim failed");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].record, record);

    survivor.ack(&reclaimed[0].id).await.expect("Ack failed");

    cleanup_keys(&pool, vec![config.stream.clone()]).await;
}

// =============================================================================
// Pipeline
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_writer_drains_queue_into_store() {
    let pool = test_pool().await;
    let config = test_queue_config("pipeline");

    let queue = IngestQueue::new(Arc::clone(&pool), config.clone());
    let consumer = QueueConsumer::new(Arc::clone(&pool), config.clone())
        .await
        .expect("Failed to register consumer");
    let store = RelationalStore::open(":memory:")
        .await
        .expect("Failed to open in-memory store");

    // Millisecond-truncated timestamp, the precision the store keeps
    let now = chrono::DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
        .expect("Current time is representable");
    let record = MetricRecord::new("live_pipeline", 3.5)
        .with_timestamp(now)
        .with_source("itest")
        .with_tag("suite", "queue_live");
    queue.enqueue(&record).await.expect("Enqueue failed");

    let writer = Writer::new(consumer, Arc::new(store.clone()), &config);
    let stats = writer.stats();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { writer.run(shutdown_rx).await });

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while stats.snapshot().written == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    shutdown_tx.send(()).expect("Writer already stopped");
    handle.await.expect("Writer task panicked");

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.written, 1);
    assert_eq!(snapshot.write_failures, 0);

    // Exactly one persisted record, matching what was enqueued
    let results = store
        .query_raw(&RawQuery::default().with_name("live_pipeline"))
        .await
        .expect("Query failed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], record);

    cleanup_keys(&pool, vec![config.stream.clone()]).await;
}

// =============================================================================
// Tagged Store
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_tagged_store_round_trip() {
    let pool = test_pool().await;
    let prefix = format!("metrond:test:tagged:{}", Uuid::new_v4());
    let store = TaggedStore::new(Arc::clone(&pool), prefix.clone());

    // Now-relative timestamps keep the records inside the default query
    // bounds and the name listing's lookback. Truncated to milliseconds,
    // which is the precision the store keeps.
    let now = chrono::DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
        .expect("Current time is representable");
    let records = vec![
        MetricRecord::new("live_cpu", 30.0)
            .with_timestamp(now - Duration::minutes(2))
            .with_source("web-01")
            .with_tag("host", "web-01"),
        MetricRecord::new("live_cpu", 60.0)
            .with_timestamp(now - Duration::minutes(1))
            .with_source("web-02")
            .with_tag("host", "web-02"),
        MetricRecord::new("live_mem", 512.0)
            .with_timestamp(now)
            .with_source("web-01"),
    ];
    for record in &records {
        store.write(record).await.expect("Write failed");
    }

    store.ping().await.expect("Ping failed");

    let cpu = store
        .query_raw(&RawQuery::default().with_name("live_cpu"))
        .await
        .expect("Query failed");
    assert_eq!(cpu.len(), 2);
    assert_eq!(cpu[0], records[1]);
    assert_eq!(cpu[1], records[0]);

    let filtered = store
        .query_raw(
            &RawQuery::default()
                .with_name("live_cpu")
                .with_source("web-02"),
        )
        .await
        .expect("Query failed");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].value, 60.0);

    let names = store.query_names().await.expect("Name query failed");
    assert_eq!(names, vec!["live_cpu", "live_mem"]);

    cleanup_keys(
        &pool,
        vec![
            format!("{prefix}:series:live_cpu"),
            format!("{prefix}:series:live_mem"),
            format!("{prefix}:names"),
        ],
    )
    .await;
}
