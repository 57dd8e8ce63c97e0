//! Tagset cache refresh worker

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::cache::TagsetCache;
use crate::services::framework::{Service, ServiceError, ServiceStatus};
use crate::services::scheduler::PeriodicRunner;

/// Periodically pulls newly created tagsets and time series into the cache
pub struct TagsetRefreshService {
    cache: Arc<TagsetCache>,
    runner: PeriodicRunner,
    status: RwLock<ServiceStatus>,
}

impl TagsetRefreshService {
    /// Create the worker with the configured interval and timeout
    pub fn new(cache: Arc<TagsetCache>, interval: Duration, timeout: Duration) -> Self {
        Self {
            cache,
            runner: PeriodicRunner::new(interval, timeout, 0.1),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }
}

#[async_trait::async_trait]
impl Service for TagsetRefreshService {
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;

        let cache = self.cache.clone();
        self.runner
            .run("tagset-cache-refresh", shutdown, move || {
                let cache = cache.clone();
                async move { cache.refresh().await.map(|_| ()) }
            })
            .await;

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tagset-cache-refresh"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
