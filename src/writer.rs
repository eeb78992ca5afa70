//! Writer loop draining the ingestion queue into storage
//!
//! Consumes deliveries in batches, persists each record, and acknowledges
//! a delivery only after its write succeeded. A failed write leaves the
//! delivery pending, so the queue re-delivers it; entries stranded by a
//! dead writer are reclaimed on a timer. Both are the at-least-once path,
//! duplicate storage is accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::redis::{Delivery, QueueConsumer};
use crate::storage::MetricStore;

/// Counters over one writer's lifetime
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Deliveries received from the queue
    pub delivered: AtomicU64,

    /// Records persisted
    pub written: AtomicU64,

    /// Write attempts that failed and were left for redelivery
    pub write_failures: AtomicU64,

    /// Deliveries taken over from dead consumers
    pub reclaimed: AtomicU64,
}

impl WriterStats {
    /// Get a snapshot of the counters
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of writer counters at a point in time
#[derive(Debug, Clone, Copy)]
pub struct WriterStatsSnapshot {
    /// Deliveries received from the queue
    pub delivered: u64,
    /// Records persisted
    pub written: u64,
    /// Write attempts that failed
    pub write_failures: u64,
    /// Deliveries taken over from dead consumers
    pub reclaimed: u64,
}

/// Queue consumer loop writing records to a storage backend
pub struct Writer {
    consumer: QueueConsumer,
    store: Arc<dyn MetricStore>,
    reclaim_interval: Duration,
    error_backoff: Duration,
    stats: Arc<WriterStats>,
}

impl Writer {
    /// Create a writer over an established consumer and backend
    pub fn new(consumer: QueueConsumer, store: Arc<dyn MetricStore>, config: &QueueConfig) -> Self {
        Self {
            consumer,
            store,
            reclaim_interval: Duration::from_millis(config.reclaim_interval_ms),
            error_backoff: Duration::from_secs(1),
            stats: Arc::new(WriterStats::default()),
        }
    }

    /// Shared handle to the writer's counters
    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Run until the shutdown signal fires
    ///
    /// Consume errors are logged and retried after a short backoff; only
    /// shutdown exits the loop.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            consumer = self.consumer.consumer_name(),
            backend = self.store.backend_id(),
            "Writer started"
        );

        let mut reclaim_timer = tokio::time::interval(self.reclaim_interval);
        reclaim_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    break;
                }
                _ = reclaim_timer.tick() => {
                    self.reclaim().await;
                }
                batch = self.consumer.next_batch() => {
                    match batch {
                        Ok(deliveries) => self.process(deliveries).await,
                        Err(e) => {
                            error!(error = %e, "Queue read failed, backing off");
                            tokio::time::sleep(self.error_backoff).await;
                        }
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            written = stats.written,
            write_failures = stats.write_failures,
            reclaimed = stats.reclaimed,
            "Writer stopped"
        );
    }

    async fn reclaim(&self) {
        match self.consumer.reclaim_stale().await {
            Ok(deliveries) if deliveries.is_empty() => {}
            Ok(deliveries) => {
                debug!(count = deliveries.len(), "Reclaimed stale deliveries");
                self.stats
                    .reclaimed
                    .fetch_add(deliveries.len() as u64, Ordering::Relaxed);
                self.process(deliveries).await;
            }
            Err(e) => warn!(error = %e, "Reclaim failed"),
        }
    }

    /// Persist a batch, acknowledging each delivery after its write
    async fn process(&self, deliveries: Vec<Delivery>) {
        self.stats
            .delivered
            .fetch_add(deliveries.len() as u64, Ordering::Relaxed);

        for delivery in deliveries {
            match self.store.write(&delivery.record).await {
                Ok(()) => {
                    self.stats.written.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.consumer.ack(&delivery.id).await {
                        // The record is stored; redelivery will store a
                        // duplicate, which at-least-once permits
                        warn!(id = %delivery.id, error = %e, "Ack failed after write");
                    }
                }
                Err(e) => {
                    self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        id = %delivery.id,
                        metric = %delivery.record.name,
                        error = %e,
                        "Write failed, leaving delivery pending"
                    );
                }
            }
        }
    }
}
