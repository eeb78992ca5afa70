//! Query service façade
//!
//! Stateless front door for the read path. Raw queries pass through to the
//! storage backend unchanged; aggregate queries pull raw records over the
//! configured lookback and reduce them through the aggregation engine,
//! unless the backend can group in SQL with identical bucket boundaries;
//! name listings degrade to an empty set on backend failure.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error};

use crate::aggregate::{aggregate, AggregateBucket, AggregateFn, Window};
use crate::config::AggregationConfig;
use crate::error::StorageError;
use crate::storage::{MetricStore, RawQuery};
use crate::types::MetricRecord;

/// Read-path façade over a storage backend and the aggregation engine
///
/// Holds nothing but the shared store handle and the aggregation settings;
/// every call is independent.
pub struct QueryService {
    store: Arc<dyn MetricStore>,
    config: AggregationConfig,
}

impl QueryService {
    /// Create a service over the given backend
    pub fn new(store: Arc<dyn MetricStore>, config: AggregationConfig) -> Self {
        Self { store, config }
    }

    /// Identifier of the backend answering queries
    pub fn backend_id(&self) -> &str {
        self.store.backend_id()
    }

    /// Raw records matching the filter, newest first
    pub async fn raw(&self, query: &RawQuery) -> Result<Vec<MetricRecord>, StorageError> {
        self.store.query_raw(query).await
    }

    /// Aggregate buckets over the lookback window, ascending by bucket start
    ///
    /// Offers the backend its native grouping first; when the backend
    /// declines, pulls raw records (capped at `max_samples`) and buckets
    /// them in-process.
    pub async fn aggregate(
        &self,
        name: Option<&str>,
        window: Window,
        function: AggregateFn,
    ) -> Result<Vec<AggregateBucket>, StorageError> {
        let now = Utc::now();
        let mut query = RawQuery::default()
            .with_start(now - Duration::hours(i64::from(self.config.lookback_hours)))
            .with_end(now)
            .with_limit(self.config.max_samples);
        if let Some(name) = name {
            query = query.with_name(name);
        }

        if let Some(buckets) = self
            .store
            .aggregate_pushdown(&query, window, function)
            .await?
        {
            debug!(
                backend = self.store.backend_id(),
                window = window.as_str(),
                function = function.as_str(),
                buckets = buckets.len(),
                "Aggregation grouped by the backend"
            );
            return Ok(buckets);
        }

        let records = self.store.query_raw(&query).await?;
        Ok(aggregate(&records, window, function))
    }

    /// Distinct metric names, ascending; empty on backend failure
    pub async fn names(&self) -> Vec<String> {
        match self.store.query_names().await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "Name listing failed, returning empty set");
                Vec::new()
            }
        }
    }

    /// Check backend connectivity
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.store.ping().await
    }
}
