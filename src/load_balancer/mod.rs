// src/load_balancer/mod.rs
mod algorithm;
mod least_loaded;
mod round_robin;

pub use algorithm::Selector;
pub use least_loaded::LeastLoadedSelector;
pub use round_robin::RoundRobinSelector;
pub use crate::config::LoadBalancerAlgorithm;

use std::sync::Arc;

pub fn create_selector(algorithm: LoadBalancerAlgorithm) -> Arc<dyn Selector> {
    match algorithm {
        LoadBalancerAlgorithm::LeastLoaded => Arc::new(LeastLoadedSelector::new()),
        LoadBalancerAlgorithm::RoundRobin => Arc::new(RoundRobinSelector::new()),
    }
}
