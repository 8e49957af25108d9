// src/balancer.rs
//! The balancing engine as one unit: registry, selection, dispatch, health
//! probing and shutdown behind the administrative operations.

use crate::config::{Config, LoadBalancerAlgorithm};
use crate::health::HealthChecker;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::load_balancer::create_selector;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::proxy::{
    BackendStatus, Dispatcher, HyperUpstream, ProxyError, Registry, RegistryError, Upstream,
};
use crate::retry::RetryStrategy;
use anyhow::{Context, Result};
use hyper::{Body, Request, Response};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Balancer {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    health: Arc<HealthChecker>,
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<MetricsCollector>,
    strategy: LoadBalancerAlgorithm,
}

/// Everything the `/stats` endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStatus {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub strategy: LoadBalancerAlgorithm,
    pub state: LifecycleState,
    pub backends: Vec<BackendStatus>,
}

impl Balancer {
    pub fn new(config: &Config, metrics: Arc<MetricsCollector>) -> Result<Self> {
        Self::with_upstream(config, metrics, Arc::new(HyperUpstream::new()))
    }

    /// Build a balancer that reaches backends through `upstream`.
    pub fn with_upstream(
        config: &Config,
        metrics: Arc<MetricsCollector>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        for address in &config.backends {
            registry
                .add(address)
                .with_context(|| format!("Invalid backend in configuration: {}", address))?;
        }

        let lifecycle = Arc::new(Lifecycle::new());
        let health = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            registry.clone(),
            Some(metrics.clone()),
        )?);

        let dispatcher = Dispatcher::new(
            registry.clone(),
            create_selector(config.strategy),
            upstream,
            RetryStrategy::new(config.retry.clone()),
            config.proxy.request_timeout(),
            metrics.clone(),
            lifecycle.clone(),
        );

        metrics.update_backend_counts(registry.healthy_count(), registry.len());
        info!(
            backends = registry.len(),
            strategy = config.strategy.as_str(),
            "Balancer initialised"
        );

        Ok(Self {
            registry,
            dispatcher,
            health,
            lifecycle,
            metrics,
            strategy: config.strategy,
        })
    }

    pub fn add_server(&self, address: &str) -> Result<(), RegistryError> {
        let backend = self.registry.add(address)?;
        self.health.watch(backend);
        self.metrics
            .update_backend_counts(self.registry.healthy_count(), self.registry.len());
        Ok(())
    }

    /// Remove a backend after its in-flight requests have finished.
    pub async fn remove_server(&self, address: &str) -> Result<(), RegistryError> {
        let backend = self.registry.remove(address).await?;
        self.health.unwatch(backend.address());
        self.metrics.forget_backend(backend.address());
        self.metrics
            .update_backend_counts(self.registry.healthy_count(), self.registry.len());
        Ok(())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn status(&self) -> BalancerStatus {
        BalancerStatus {
            metrics: self.metrics.snapshot(),
            strategy: self.strategy,
            state: self.lifecycle.state(),
            backends: self.registry.snapshot().iter().map(|b| b.status()).collect(),
        }
    }

    /// Start (or restart) the per-backend probe loops. A zero interval is
    /// rejected.
    pub fn start_health_checks(&self, interval: Duration) -> Result<()> {
        self.health.start(interval)
    }

    /// Stop admitting requests, wait for in-flight ones, then stop probing.
    pub async fn shutdown(&self) {
        info!("Shutting down load balancer gracefully");
        self.lifecycle.shutdown().await;
        self.health.shutdown();
        info!("Load balancer stopped");
    }

    pub async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        self.dispatcher.dispatch(req, client_addr).await
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}
