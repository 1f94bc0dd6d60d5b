//! Weighted round-robin selection of backend instances.
//!
//! Selection state is one atomic counter per route, independent of the
//! registry lock. For a fixed candidate set the sequence is deterministic:
//! slot `n` maps onto the cumulative weights at `n % total_weight`, so over
//! every window of `total_weight` picks each instance is chosen exactly
//! `weight` times.

use crate::model::BackendInstance;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-route weighted round-robin state.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counters: DashMap<String, Arc<AtomicU64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, route: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.get(route) {
            return Arc::clone(counter.value());
        }
        Arc::clone(
            self.counters
                .entry(route.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .value(),
        )
    }

    /// Picks one of `candidates` for `route`, advancing the route's counter.
    pub fn select<'a>(
        &self,
        route: &str,
        candidates: &[&'a BackendInstance],
    ) -> Option<&'a BackendInstance> {
        let total: u64 = candidates.iter().map(|i| u64::from(i.weight.max(1))).sum();
        if total == 0 {
            return None;
        }

        let slot = self.counter(route).fetch_add(1, Ordering::Relaxed) % total;
        let mut cumulative = 0u64;
        for candidate in candidates {
            cumulative += u64::from(candidate.weight.max(1));
            if slot < cumulative {
                return Some(*candidate);
            }
        }
        candidates.last().copied()
    }

    /// Drops counters of routes that no longer exist.
    pub fn retain(&self, mut live: impl FnMut(&str) -> bool) {
        self.counters.retain(|name, _| live(name.as_str()));
    }

    /// Returns the number of routes with selection state.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
