// src/load_balancer/round_robin.rs
use crate::load_balancer::Selector;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cycles through the healthy backends with one shared cursor. The cursor
/// advances on every call, so distribution stays even regardless of load.
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RoundRobinSelector {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed);

        let healthy: Vec<&Arc<Backend>> =
            backends.iter().filter(|b| b.is_selectable()).collect();
        if healthy.is_empty() {
            return None;
        }

        Some(healthy[index % healthy.len()].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
