//! Metrond sample-data generator
//!
//! Posts batches of plausible metrics to a running ingestion agent so the
//! query surface has something to show. Purely a client; it never talks to
//! Redis or the database directly.
//!
//! # Example Usage
//!
//! ```bash
//! # One batch per second for a minute against a local agent
//! ./seed
//!
//! # Heavier, faster, elsewhere
//! ./seed --target http://10.0.0.5:5000 --count 500 --interval-ms 200 --batch-size 20
//! ```

use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

// =============================================================================
// Command Line
// =============================================================================

/// Sample-data generator for the metrond pipeline
#[derive(Debug, Parser)]
#[command(name = "seed", version)]
struct Args {
    /// Base URL of the ingestion agent
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    target: String,

    /// Number of batches to send
    #[arg(long, default_value_t = 60)]
    count: usize,

    /// Milliseconds to sleep between batches
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Metrics per batch
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
}

/// Counts reported by the agent for one batch
#[derive(Debug, Default, Deserialize)]
struct BatchSummary {
    queued_count: u64,
    total_count: u64,
}

// =============================================================================
// Sample Generation
// =============================================================================

/// One batch of plausible samples across a few metric families
///
/// Click counters carry a page tag, latency and resource gauges carry a
/// host source, so both the tag path and the source filter have data to
/// chew on.
fn sample_batch(rng: &mut impl Rng, batch_size: usize) -> Value {
    const PAGES: [&str; 4] = ["home", "search", "checkout", "account"];
    const HOSTS: [&str; 3] = ["web-01", "web-02", "web-03"];

    let mut metrics = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let host = HOSTS[rng.random_range(0..HOSTS.len())];
        let metric = match i % 4 {
            0 => json!({
                "name": "page_clicks",
                "value": 1.0,
                "tags": { "page": PAGES[rng.random_range(0..PAGES.len())] },
                "source": host,
            }),
            1 => json!({
                "name": "request_latency_ms",
                "value": 20.0 + rng.random::<f64>() * 180.0,
                "tags": { "route": "/api/checkout" },
                "source": host,
            }),
            2 => json!({
                "name": "cpu_percent",
                "value": 5.0 + rng.random::<f64>() * 90.0,
                "source": host,
            }),
            _ => json!({
                "name": "memory_used_mb",
                "value": 512.0 + rng.random::<f64>() * 1536.0,
                "source": host,
            }),
        };
        metrics.push(metric);
    }

    json!({ "metrics": metrics })
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let url = format!("{}/metrics/batch", args.target.trim_end_matches('/'));
    info!(
        url = %url,
        count = args.count,
        batch_size = args.batch_size,
        "Seeding metrics"
    );

    let mut rng = rand::rng();
    let mut queued_total: u64 = 0;
    let mut failed_batches: u64 = 0;

    for batch_no in 0..args.count {
        let body = sample_batch(&mut rng, args.batch_size);

        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                let summary: BatchSummary = response.json().await.unwrap_or_default();
                queued_total += summary.queued_count;
                if summary.queued_count < summary.total_count {
                    error!(
                        batch = batch_no,
                        queued = summary.queued_count,
                        total = summary.total_count,
                        "Agent dropped part of the batch"
                    );
                }
            }
            Ok(response) => {
                failed_batches += 1;
                error!(batch = batch_no, status = %response.status(), "Agent rejected batch");
            }
            Err(e) => {
                failed_batches += 1;
                error!(batch = batch_no, error = %e, "Failed to reach agent");
            }
        }

        if batch_no + 1 < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    info!(queued = queued_total, failed_batches, "Seeding complete");
    Ok(())
}
