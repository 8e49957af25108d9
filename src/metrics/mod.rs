// src/metrics/mod.rs
mod collector;

pub use collector::{ActiveRequest, MetricsCollector, MetricsRegistry, MetricsSnapshot, Timer};
