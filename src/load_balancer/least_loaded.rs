// src/load_balancer/least_loaded.rs
use crate::load_balancer::Selector;
use crate::proxy::Backend;
use std::sync::Arc;

/// Picks the healthy backend with the fewest in-flight requests. Ties go to
/// the backend registered first.
#[derive(Debug, Default)]
pub struct LeastLoadedSelector;

impl LeastLoadedSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for LeastLoadedSelector {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // `min_by_key` keeps the first of equal minimums.
        backends
            .iter()
            .filter(|b| b.is_selectable())
            .min_by_key(|b| b.load())
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::LoadGuard;

    fn with_loads(loads: &[usize]) -> (Vec<Arc<Backend>>, Vec<LoadGuard>) {
        let mut guards = Vec::new();
        let pool = loads
            .iter()
            .enumerate()
            .map(|(i, &load)| {
                let b = Arc::new(Backend::new(&format!("http://127.0.0.1:{}", 8001 + i)).unwrap());
                guards.extend((0..load).map(|_| b.try_acquire().unwrap()));
                b
            })
            .collect();
        (pool, guards)
    }

    #[test]
    fn picks_minimum_then_breaks_ties_in_order() {
        let selector = LeastLoadedSelector::new();
        let (pool, mut guards) = with_loads(&[3, 1, 2]);

        let first = selector.select_backend(&pool).unwrap();
        assert_eq!(first.address(), pool[1].address());

        // loads are now [3, 2, 2]
        guards.push(first.try_acquire().unwrap());
        let second = selector.select_backend(&pool).unwrap();
        assert_eq!(second.address(), pool[1].address());
        assert_eq!(second.load(), 2);
    }

    #[test]
    fn skips_unhealthy_even_when_idle() {
        let selector = LeastLoadedSelector::new();
        let (pool, _guards) = with_loads(&[0, 4]);
        pool[0].set_health(false);

        let chosen = selector.select_backend(&pool).unwrap();
        assert_eq!(chosen.address(), pool[1].address());
    }

    #[test]
    fn none_when_all_unhealthy() {
        let selector = LeastLoadedSelector::new();
        let (pool, _guards) = with_loads(&[0, 0]);
        pool.iter().for_each(|b| {
            b.set_health(false);
        });
        assert!(selector.select_backend(&pool).is_none());
    }
}
