// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, Registry};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs one independent probe loop per backend.
///
/// Probe failures never propagate: they only flip the backend's health flag.
pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<Registry>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    period: Mutex<Option<Duration>>,
    probes: DashMap<String, JoinHandle<()>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<Registry>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .build()
            .context("Failed to create health check HTTP client")?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            registry,
            client,
            metrics,
            period: Mutex::new(None),
            probes: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start probing every registered backend at a fixed `period`. Backends
    /// added later get a loop through [`HealthChecker::watch`].
    ///
    /// Calling `start` again replaces every running loop with one at the
    /// new period.
    pub fn start(self: &Arc<Self>, period: Duration) -> Result<()> {
        if period.is_zero() {
            bail!("Health check interval must be greater than zero");
        }

        *self.period.lock() = Some(period);
        info!("Starting health checks with interval: {:?}", period);

        self.probes.retain(|_, handle| {
            handle.abort();
            false
        });
        for backend in self.registry.snapshot().iter() {
            self.watch(backend.clone());
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.period.lock().is_some() && !*self.shutdown_rx.borrow()
    }

    /// Spawn a probe loop for `backend` if checks are running and it has
    /// none yet.
    pub fn watch(self: &Arc<Self>, backend: Arc<Backend>) {
        let Some(period) = *self.period.lock() else {
            return;
        };
        if *self.shutdown_rx.borrow() {
            return;
        }

        let address = backend.address().to_string();
        if let Some(existing) = self.probes.get(&address) {
            if !existing.is_finished() {
                return;
            }
        }

        let checker = self.clone();
        let handle = tokio::spawn(async move { checker.probe_loop(backend, period).await });
        if let Some(old) = self.probes.insert(address, handle) {
            old.abort();
        }
    }

    /// Abort the probe loop of a removed backend.
    pub fn unwatch(&self, address: &str) {
        if let Some((_, handle)) = self.probes.remove(address) {
            handle.abort();
            debug!(backend = %address, "Stopped health probe");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn probe_loop(&self, backend: Arc<Backend>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.registry.contains(&backend) {
                        debug!(backend = %backend.address(), "Backend left the registry, probe exiting");
                        break;
                    }
                    self.check_backend(&backend).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(backend = %backend.address(), "Health probe shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe `backend` once and apply the result to its health flag.
    pub async fn check_backend(&self, backend: &Backend) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let url = format!("{}{}", backend.address(), self.config.path);

        let result = timeout(self.config.timeout(), self.client.get(&url).send()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (healthy, error) = match result {
            Ok(Ok(response)) if response.status() == StatusCode::OK => (true, None),
            Ok(Ok(response)) => (false, Some(format!("HTTP {}", response.status()))),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("Probe timeout".to_string())),
        };

        let was_healthy = backend.set_health(healthy);

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(backend.address(), healthy);
            metrics.update_backend_counts(self.registry.healthy_count(), self.registry.len());
        }

        match (was_healthy, healthy) {
            (true, false) => warn!(
                backend = %backend.address(),
                error = error.as_deref().unwrap_or("unknown"),
                "Backend is unhealthy"
            ),
            (false, true) => info!(backend = %backend.address(), "Backend recovered"),
            _ => debug!(backend = %backend.address(), healthy, response_time_ms, "Health probe"),
        }

        HealthCheckResult {
            backend: backend.address().to_string(),
            healthy,
            response_time_ms,
            error,
        }
    }
}
