// src/proxy/registry.rs
use super::backend::{normalize_address, Backend};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How often `remove` re-checks a draining backend's load.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid backend address: {0:?}")]
    InvalidAddress(String),

    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),

    #[error("Backend not found: {0}")]
    NotFound(String),
}

/// Ordered set of backends keyed by address.
///
/// Readers get the current list with a single atomic pointer load; writers
/// serialize on `write_lock` and publish a fresh list. The lock order is
/// always registry first, backend second.
pub struct Registry {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a new healthy, idle backend at the end of the list.
    pub fn add(&self, address: &str) -> Result<Arc<Backend>, RegistryError> {
        let backend = Arc::new(Backend::new(address)?);

        let _write = self.write_lock.lock();
        let current = self.backends.load();
        if current.iter().any(|b| b.address() == backend.address()) {
            return Err(RegistryError::DuplicateBackend(backend.address().to_string()));
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(backend.clone());
        self.backends.store(Arc::new(next));

        info!(backend = %backend.address(), "Added backend");
        Ok(backend)
    }

    /// Remove a backend once its in-flight load has drained to zero.
    ///
    /// The backend stops accepting new load immediately; this call then
    /// polls every [`DRAIN_POLL_INTERVAL`] until the last request finishes.
    pub async fn remove(&self, address: &str) -> Result<Arc<Backend>, RegistryError> {
        let address = normalize_address(address);
        let backend = {
            let _write = self.write_lock.lock();
            let backend = self
                .backends
                .load()
                .iter()
                .find(|b| b.address() == address)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(address.to_string()))?;
            backend.begin_drain();
            backend
        };

        let mut drain = DrainGuard {
            backend: &backend,
            finished: false,
        };

        info!(backend = %address, load = backend.load(), "Draining backend");
        while backend.load() > 0 {
            debug!(backend = %address, load = backend.load(), "Waiting for backend to drain");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let _write = self.write_lock.lock();
        let current = self.backends.load();
        if !current.iter().any(|b| Arc::ptr_eq(b, &backend)) {
            // A concurrent remove of the same address won the race.
            drain.finished = true;
            return Err(RegistryError::NotFound(address.to_string()));
        }

        let next: Vec<_> = current
            .iter()
            .filter(|b| !Arc::ptr_eq(b, &backend))
            .cloned()
            .collect();
        self.backends.store(Arc::new(next));
        drain.finished = true;
        drop(drain);

        info!(backend = %address, "Removed backend");
        Ok(backend)
    }

    /// Current backend list. Selection works on this copy without holding
    /// any registry lock.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    pub fn get(&self, address: &str) -> Option<Arc<Backend>> {
        let address = normalize_address(address);
        self.backends
            .load()
            .iter()
            .find(|b| b.address() == address)
            .cloned()
    }

    pub fn contains(&self, backend: &Arc<Backend>) -> bool {
        self.backends.load().iter().any(|b| Arc::ptr_eq(b, backend))
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.load().is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.load().iter().filter(|b| b.is_healthy()).count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reopens a backend for traffic if a `remove` is abandoned mid-drain.
struct DrainGuard<'a> {
    backend: &'a Arc<Backend>,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.backend.cancel_drain();
        }
    }
}
