// tests/selection_properties.rs
use http_load_balancer::load_balancer::{LeastLoadedSelector, RoundRobinSelector, Selector};
use http_load_balancer::proxy::{Backend, LoadGuard};
use proptest::prelude::*;
use std::sync::Arc;

fn pool(n: usize) -> Vec<Arc<Backend>> {
    (0..n)
        .map(|i| Arc::new(Backend::new(&format!("http://10.0.0.{}:80", i + 1)).unwrap()))
        .collect()
}

proptest! {
    #[test]
    fn round_robin_is_fair(n in 1usize..8, k in 1usize..10) {
        let backends = pool(n);
        let selector = RoundRobinSelector::new();

        let mut counts = vec![0usize; n];
        for _ in 0..n * k {
            let picked = selector.select_backend(&backends).unwrap();
            let index = backends.iter().position(|b| Arc::ptr_eq(b, &picked)).unwrap();
            counts[index] += 1;
        }

        prop_assert!(counts.iter().all(|&c| c == k), "uneven counts {:?}", counts);
    }

    #[test]
    fn round_robin_skips_unhealthy(health in prop::collection::vec(any::<bool>(), 1..8)) {
        let backends = pool(health.len());
        for (backend, healthy) in backends.iter().zip(&health) {
            backend.set_health(*healthy);
        }
        let selector = RoundRobinSelector::new();

        for _ in 0..health.len() * 2 {
            match selector.select_backend(&backends) {
                Some(picked) => prop_assert!(picked.is_healthy()),
                None => prop_assert!(health.iter().all(|h| !h)),
            }
        }
    }

    #[test]
    fn least_loaded_picks_a_minimum(
        setup in prop::collection::vec((0usize..6, any::<bool>()), 1..8)
    ) {
        let backends = pool(setup.len());
        let mut guards: Vec<LoadGuard> = Vec::new();
        for (backend, (load, healthy)) in backends.iter().zip(&setup) {
            for _ in 0..*load {
                guards.push(backend.try_acquire().unwrap());
            }
            backend.set_health(*healthy);
        }

        let selector = LeastLoadedSelector::new();
        let min = setup.iter().filter(|(_, healthy)| *healthy).map(|(load, _)| *load).min();

        match (selector.select_backend(&backends), min) {
            (Some(picked), Some(min)) => {
                prop_assert!(picked.is_healthy());
                prop_assert_eq!(picked.load(), min);
            }
            (None, None) => {}
            (picked, min) => prop_assert!(false, "picked {:?} with minimum {:?}", picked.map(|b| b.load()), min),
        }
    }

    #[test]
    fn load_tracks_outstanding_guards(ops in prop::collection::vec(any::<bool>(), 0..64)) {
        let backend = Arc::new(Backend::new("http://10.0.0.1:80").unwrap());
        let mut guards = Vec::new();

        for acquire in ops {
            if acquire {
                guards.push(backend.try_acquire().unwrap());
            } else {
                guards.pop();
            }
            prop_assert_eq!(backend.load(), guards.len());
        }

        guards.clear();
        prop_assert_eq!(backend.load(), 0);
    }
}
