//! Service framework
//!
//! A small lifecycle layer for the background workers: a [`Service`] trait
//! with a broadcast shutdown signal, and a [`ServiceManager`] that starts
//! registered services and stops them with a bounded grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Trait for long-running background services
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run the service's main loop until the shutdown signal fires
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and identification
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Running normally
    Running,
    /// Stopped (cleanly or never started)
    Stopped,
    /// Failed with an error
    Failed(String),
}

impl ServiceStatus {
    /// Whether the service is in a healthy state
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }
}

/// Errors surfaced by services and the manager
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service failed during execution
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// A service with the same name is already registered
    #[error("Service already registered: {0}")]
    AlreadyRegistered(&'static str),
}

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
}

/// Coordinates background service lifecycle
pub struct ServiceManager {
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ServiceManager {
    /// Create a manager with the given shutdown grace period
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_timeout,
        }
    }

    /// Register a service
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRegistered(name));
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
            },
        );
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Start every registered service
    pub fn start_all(&self) {
        let mut services = self.services.write();
        for (name, handle) in services.iter_mut() {
            if handle.task.is_some() {
                continue;
            }
            let service = handle.service.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handle.task = Some(tokio::spawn(async move { service.start(shutdown_rx).await }));
            tracing::info!(service = name, "Service started");
        }
    }

    /// Signal shutdown and wait for services to stop, bounded by the grace
    /// period
    pub async fn shutdown(&self) {
        tracing::info!("Stopping background services");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped"),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error")
                }
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => tracing::warn!(service = name, "Service shutdown timed out"),
            }
        }
    }

    /// Status of every registered service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        let services = self.services.read();
        services
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Whether every service reports healthy
    pub fn is_healthy(&self) -> bool {
        let services = self.services.read();
        services.values().all(|h| h.service.status().is_healthy())
    }
}
