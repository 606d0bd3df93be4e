// Instance selection strategies
//
// Round-robin keeps one monotonic counter per service name that persists
// across calls. Least-conn currently aliases least-load and ip-hash
// aliases random. Selection bumps the chosen instance's load counter;
// `release` is the completion hook that undoes it.

use crate::routing::discovery::ServiceInstance;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Configured selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    Random,
    LeastLoad,
    LeastConn,
    IpHash,
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalanceStrategy::Random => write!(f, "random"),
            LoadBalanceStrategy::LeastLoad => write!(f, "least_load"),
            LoadBalanceStrategy::LeastConn => write!(f, "least_conn"),
            LoadBalanceStrategy::IpHash => write!(f, "ip_hash"),
        }
    }
}

/// Picks one healthy instance per request and tracks per-instance load.
pub struct LoadBalancer {
    strategy: RwLock<LoadBalanceStrategy>,
    round_robin_counters: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            round_robin_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: LoadBalanceStrategy) {
        *self.strategy.write() = strategy;
    }

    /// Select an instance for `service_name` from the candidate list. Only
    /// healthy instances are considered; the winner's load counter is
    /// incremented. Returns `None` when no candidate is eligible.
    pub fn select(
        &self,
        service_name: &str,
        instances: &[Arc<ServiceInstance>],
    ) -> Option<Arc<ServiceInstance>> {
        let healthy: Vec<&Arc<ServiceInstance>> =
            instances.iter().filter(|i| i.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }

        let chosen = match self.strategy() {
            LoadBalanceStrategy::RoundRobin => {
                let mut counters = self.round_robin_counters.lock();
                let counter = counters.entry(service_name.to_string()).or_insert(0);
                let index = *counter % healthy.len();
                *counter = counter.wrapping_add(1);
                healthy[index]
            }
            // ip_hash is an alias of random until a consistent-hash
            // selection over the client address lands.
            LoadBalanceStrategy::Random | LoadBalanceStrategy::IpHash => {
                let index = rand::rng().random_range(0..healthy.len());
                healthy[index]
            }
            // least_conn is an alias of least_load; both read the same
            // outstanding-work counter. First encountered wins ties.
            LoadBalanceStrategy::LeastLoad | LoadBalanceStrategy::LeastConn => healthy
                .iter()
                .copied()
                .min_by_key(|i| i.load())
                .expect("non-empty healthy list"),
        };

        chosen.add_load(1);
        Some(Arc::clone(chosen))
    }

    /// Completion hook: undo the load bump once downstream finishes.
    pub fn release(&self, instance: &ServiceInstance) {
        instance.add_load(-1);
    }

    /// Forget per-service round-robin positions.
    pub fn reset(&self) {
        self.round_robin_counters.lock().clear();
    }
}
