//! Housekeeping: retention-bound pruning of orphans and cache compaction
//!
//! Order matters: orphaned `time_series` rows go first because the metric
//! and tagset deletions rely on `time_series` for their referential check.
//! Rows created inside the retention window are protected so we never race
//! an ingest batch whose cached ids are still live.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::postgres::PgPool;
use tokio::sync::broadcast;

use crate::cache::TagsetCache;
use crate::error::Result;
use crate::services::framework::{Service, ServiceError, ServiceStatus};
use crate::services::scheduler::PeriodicRunner;

/// Deletion batch size for the `time_series` sweep
const TIME_SERIES_BATCH: i64 = 1000;

/// One housekeeping pass over the database and the cache
pub struct Housekeeper {
    pool: PgPool,
    cache: Arc<TagsetCache>,
    retention: Duration,
}

impl Housekeeper {
    /// Create a housekeeper bound to the retention window
    pub fn new(pool: PgPool, cache: Arc<TagsetCache>, retention: Duration) -> Self {
        Self {
            pool,
            cache,
            retention,
        }
    }

    fn retention_interval(&self) -> String {
        format!("{} seconds", self.retention.as_secs())
    }

    /// Run one full cycle
    pub async fn run_cycle(&self) -> Result<()> {
        let series = self.prune_time_series().await?;
        let metrics = self.prune_metrics().await?;
        let tagsets = self.prune_tagsets().await?;
        let cached = self.cache.prune().await?;

        tracing::info!(
            series,
            metrics,
            tagsets,
            cached,
            "Housekeeping cycle complete"
        );
        Ok(())
    }

    /// Delete `time_series` rows idle past retention with no remaining points
    ///
    /// Works in batches of 1000 until a sweep deletes nothing.
    async fn prune_time_series(&self) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let result = sqlx::query(
                "DELETE FROM time_series ts \
                 WHERE (ts.metric_id, ts.tagset_id) IN ( \
                     SELECT s.metric_id, s.tagset_id FROM time_series s \
                     WHERE now() - s.last_used > $1::interval \
                     AND NOT EXISTS ( \
                         SELECT 1 FROM point p \
                         WHERE p.metric_id = s.metric_id AND p.tagset_id = s.tagset_id \
                     ) \
                     LIMIT $2 \
                 )",
            )
            .bind(self.retention_interval())
            .bind(TIME_SERIES_BATCH)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                break;
            }
            total += result.rows_affected();
        }
        Ok(total)
    }

    /// Delete metrics past retention with no referencing series
    async fn prune_metrics(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM metric m \
             WHERE now() - m.created > $1::interval \
             AND NOT EXISTS (SELECT 1 FROM time_series ts WHERE ts.metric_id = m.id)",
        )
        .bind(self.retention_interval())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete tagsets past retention with no referencing series
    async fn prune_tagsets(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM tagset t \
             WHERE now() - t.created > $1::interval \
             AND NOT EXISTS (SELECT 1 FROM time_series ts WHERE ts.tagset_id = t.id)",
        )
        .bind(self.retention_interval())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Background service wrapping the housekeeper
pub struct HousekeepingService {
    housekeeper: Arc<Housekeeper>,
    runner: PeriodicRunner,
    status: RwLock<ServiceStatus>,
}

impl HousekeepingService {
    /// Create the worker with the configured interval and timeout
    pub fn new(housekeeper: Housekeeper, interval: Duration, timeout: Duration) -> Self {
        Self {
            housekeeper: Arc::new(housekeeper),
            runner: PeriodicRunner::new(interval, timeout, 0.2),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }
}

#[async_trait::async_trait]
impl Service for HousekeepingService {
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;

        let housekeeper = self.housekeeper.clone();
        self.runner
            .run("housekeeping", shutdown, move || {
                let housekeeper = housekeeper.clone();
                async move { housekeeper.run_cycle().await }
            })
            .await;

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "housekeeping"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
