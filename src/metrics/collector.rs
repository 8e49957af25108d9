// src/metrics/collector.rs
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Request counters for one balancer instance.
///
/// The three core counters are independent atomics with no shared lock;
/// the only relation between them is `failed_requests <= total_requests`.
pub struct MetricsCollector {
    // Core request accounting
    pub requests_total: IntCounter,
    pub failed_requests_total: IntCounter,
    pub active_connections: IntGauge,
    pub request_duration_seconds: HistogramVec,

    // Backend metrics
    pub backend_requests_total: IntCounterVec,
    pub backend_request_duration_seconds: HistogramVec,
    pub backend_load: IntGaugeVec,
    pub backend_health_status: IntGaugeVec,

    // Pool metrics
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total =
            IntCounter::new("lb_requests_total", "Total number of admitted requests")?;
        registry.register(Box::new(requests_total.clone()))?;

        let failed_requests_total = IntCounter::new(
            "lb_failed_requests_total",
            "Requests that failed after exhausting every attempt",
        )?;
        registry.register(Box::new(failed_requests_total.clone()))?;

        let active_connections =
            IntGauge::new("lb_active_connections", "Requests admitted but not yet completed")?;
        registry.register(Box::new(active_connections.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_request_duration_seconds",
                "End-to-end request duration in seconds",
            ),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        // Backend metrics
        let backend_requests_total = IntCounterVec::new(
            Opts::new("lb_backend_requests_total", "Total backend attempts"),
            &["backend", "status"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_backend_request_duration_seconds",
                "Backend attempt duration",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_request_duration_seconds.clone()))?;

        let backend_load = IntGaugeVec::new(
            Opts::new("lb_backend_load", "In-flight requests per backend"),
            &["backend"],
        )?;
        registry.register(Box::new(backend_load.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health status (1=healthy, 0=unhealthy)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        // Pool metrics
        let healthy_backends =
            IntGauge::new("lb_healthy_backends", "Number of healthy backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends =
            IntGauge::new("lb_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            failed_requests_total,
            active_connections,
            request_duration_seconds,
            backend_requests_total,
            backend_request_duration_seconds,
            backend_load,
            backend_health_status,
            healthy_backends,
            total_backends,
        })
    }

    /// Count an admitted request and keep it in `active_connections` until
    /// the returned guard is dropped.
    pub fn begin_request(&self) -> ActiveRequest<'_> {
        self.requests_total.inc();
        self.active_connections.inc();
        ActiveRequest { metrics: self }
    }

    pub fn record_failure(&self) {
        self.failed_requests_total.inc();
    }

    pub fn record_request(&self, method: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.request_duration_seconds
            .with_label_values(&[method, &status])
            .observe(duration.as_secs_f64());
    }

    pub fn record_backend_request(
        &self,
        backend: &str,
        success: bool,
        duration: Duration,
    ) {
        let status = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, status])
            .inc();

        self.backend_request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn update_backend_load(&self, backend: &str, load: usize) {
        self.backend_load
            .with_label_values(&[backend])
            .set(load as i64);
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }

    /// Drop the per-backend series of a removed backend.
    pub fn forget_backend(&self, backend: &str) {
        for status in ["success", "failure"] {
            let _ = self.backend_requests_total.remove_label_values(&[backend, status]);
        }
        let _ = self.backend_request_duration_seconds.remove_label_values(&[backend]);
        let _ = self.backend_load.remove_label_values(&[backend]);
        let _ = self.backend_health_status.remove_label_values(&[backend]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.requests_total.get(),
            failed_requests: self.failed_requests_total.get(),
            active_connections: self.active_connections.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_connections: i64,
}

/// Decrements `active_connections` exactly once, however the request ends.
pub struct ActiveRequest<'a> {
    metrics: &'a MetricsCollector,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.metrics.active_connections.dec();
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_request_guard_balances_gauge() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        {
            let _a = metrics.begin_request();
            let _b = metrics.begin_request();
            assert_eq!(metrics.snapshot().active_connections, 2);
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.failed_requests, 0);
    }

    #[test]
    fn instances_are_isolated() {
        let a = MetricsRegistry::new().unwrap().collector();
        let b = MetricsRegistry::new().unwrap().collector();

        drop(a.begin_request());
        a.record_failure();

        assert_eq!(a.snapshot().failed_requests, 1);
        assert_eq!(b.snapshot(), MetricsSnapshot {
            total_requests: 0,
            failed_requests: 0,
            active_connections: 0,
        });
    }

    #[test]
    fn gather_renders_text_format() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();
        metrics.update_backend_health("http://127.0.0.1:8001", true);
        drop(metrics.begin_request());

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains("lb_requests_total 1"));
        assert!(text.contains("lb_backend_health_status{backend=\"http://127.0.0.1:8001\"} 1"));
    }
}
