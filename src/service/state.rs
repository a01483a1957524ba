//! Shared service state.

use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::layering::ProgressRegistry;
use crate::store::LayoutStore;

/// Shared service state.
///
/// `CalculateLayout` requests carry their own graph and run against a fresh
/// in-memory store; `store` is the configured graph store, consulted only by
/// health checks.
pub struct ServiceState<S: LayoutStore + 'static> {
    /// Configured graph store, if any.
    pub store: Option<Arc<S>>,
    /// Worker settings applied to every request.
    pub config: WorkerConfig,
    /// Progress of runs started through this service.
    pub progress: Arc<ProgressRegistry>,
}

impl<S: LayoutStore + 'static> ServiceState<S> {
    /// Create state backed by a graph store.
    pub fn new(store: S, config: WorkerConfig) -> Self {
        Self {
            store: Some(Arc::new(store)),
            config,
            progress: Arc::new(ProgressRegistry::new()),
        }
    }

    /// Create state without a graph store. Health checks then only report on
    /// the process itself.
    pub fn detached(config: WorkerConfig) -> Self {
        Self {
            store: None,
            config,
            progress: Arc::new(ProgressRegistry::new()),
        }
    }

    /// Check store reachability. A detached service is always healthy.
    pub async fn store_healthy(&self) -> Result<(), String> {
        match &self.store {
            Some(store) => store.ping().await.map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }
}

impl<S: LayoutStore + 'static> Clone for ServiceState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            progress: Arc::clone(&self.progress),
        }
    }
}
