// src/proxy/backend.rs
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::registry::RegistryError;

/// Number of response durations kept per backend.
pub const LATENCY_SAMPLE_CAPACITY: usize = 100;

/// Canonical form used as the registry key: surrounding whitespace and
/// trailing slashes are not significant.
pub(crate) fn normalize_address(address: &str) -> &str {
    address.trim().trim_end_matches('/')
}

/// Mutable per-backend state. Health and load share one lock so a
/// selection never sees a torn view of the two.
#[derive(Debug)]
struct BackendState {
    healthy: bool,
    load: usize,
    draining: bool,
    latency_samples: VecDeque<Duration>,
    last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Backend {
    address: String,
    url: Url,
    state: Mutex<BackendState>,
}

impl Backend {
    /// Build a backend from its base URL. New backends start healthy with
    /// zero load.
    pub fn new(address: &str) -> Result<Self, RegistryError> {
        let address = normalize_address(address);
        if address.is_empty() {
            return Err(RegistryError::InvalidAddress(address.to_string()));
        }

        let url = Url::parse(address)
            .map_err(|_| RegistryError::InvalidAddress(address.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(RegistryError::InvalidAddress(address.to_string()));
        }

        Ok(Self {
            address: address.to_string(),
            url,
            state: Mutex::new(BackendState {
                healthy: true,
                load: 0,
                draining: false,
                latency_samples: VecDeque::with_capacity(LATENCY_SAMPLE_CAPACITY),
                last_checked: None,
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    pub fn load(&self) -> usize {
        self.state.lock().load
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Healthy and not being drained for removal.
    pub fn is_selectable(&self) -> bool {
        let state = self.state.lock();
        state.healthy && !state.draining
    }

    /// Record the outcome of a liveness probe. Returns the previous health
    /// value so callers can log transitions.
    pub fn set_health(&self, healthy: bool) -> bool {
        let mut state = self.state.lock();
        let was_healthy = state.healthy;
        state.healthy = healthy;
        state.last_checked = Some(Utc::now());
        was_healthy
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_checked
    }

    /// Increment the load counter and hand back a guard that decrements it
    /// on drop. Refused once the backend is draining.
    pub fn try_acquire(self: &Arc<Self>) -> Option<LoadGuard> {
        let mut state = self.state.lock();
        if state.draining {
            return None;
        }
        state.load += 1;
        drop(state);

        Some(LoadGuard {
            backend: self.clone(),
        })
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.load = state.load.saturating_sub(1);
    }

    pub(crate) fn begin_drain(&self) {
        self.state.lock().draining = true;
    }

    pub(crate) fn cancel_drain(&self) {
        self.state.lock().draining = false;
    }

    pub fn record_latency(&self, duration: Duration) {
        let mut state = self.state.lock();
        if state.latency_samples.len() == LATENCY_SAMPLE_CAPACITY {
            state.latency_samples.pop_front();
        }
        state.latency_samples.push_back(duration);
    }

    pub fn latency_samples(&self) -> Vec<Duration> {
        self.state.lock().latency_samples.iter().copied().collect()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        let state = self.state.lock();
        let count = state.latency_samples.len() as u32;
        if count == 0 {
            return None;
        }
        Some(state.latency_samples.iter().sum::<Duration>() / count)
    }

    pub fn status(&self) -> BackendStatus {
        let avg_latency_ms = self.average_latency().map(|d| d.as_secs_f64() * 1000.0);
        let state = self.state.lock();

        BackendStatus {
            address: self.address.clone(),
            healthy: state.healthy,
            load: state.load,
            draining: state.draining,
            avg_latency_ms,
            last_checked: state.last_checked,
        }
    }
}

/// Point-in-time view of a backend for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub address: String,
    pub healthy: bool,
    pub load: usize,
    pub draining: bool,
    pub avg_latency_ms: Option<f64>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Keeps one unit of load on a backend for as long as it is alive.
#[derive(Debug)]
pub struct LoadGuard {
    backend: Arc<Backend>,
}

impl LoadGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Deref for LoadGuard {
    type Target = Backend;

    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}
