// src/load_balancer/algorithm.rs
use crate::proxy::Backend;
use std::sync::Arc;

/// Backend selection policy.
///
/// Implementations only read backend state; they never block and never
/// mutate load. Backends that are unhealthy or draining are never returned.
pub trait Selector: Send + Sync {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}
