//! Destination selection among instances of one server type.

use meridian_discovery::AddressEntry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one instance out of a non-empty slice. Returns `None` only when the
/// slice is empty.
pub trait LoadBalancer: Send + Sync {
    fn pick<'a>(&self, instances: &'a [AddressEntry]) -> Option<&'a AddressEntry>;
}

/// Every instance is equally likely.
#[derive(Debug, Default)]
pub struct UniformRandom;

impl LoadBalancer for UniformRandom {
    fn pick<'a>(&self, instances: &'a [AddressEntry]) -> Option<&'a AddressEntry> {
        if instances.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        instances.get(index)
    }
}

/// Probability proportional to the registered weight. A weight of 0 counts as 1.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl LoadBalancer for WeightedRandom {
    fn pick<'a>(&self, instances: &'a [AddressEntry]) -> Option<&'a AddressEntry> {
        let total: u64 = instances.iter().map(|e| u64::from(e.weight.max(1))).sum();
        if total == 0 {
            return None;
        }
        let mut ticket = rand::thread_rng().gen_range(0..total);
        for entry in instances {
            let weight = u64::from(entry.weight.max(1));
            if ticket < weight {
                return Some(entry);
            }
            ticket -= weight;
        }
        instances.last()
    }
}

/// Cycles through the instances in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn pick<'a>(&self, instances: &'a [AddressEntry]) -> Option<&'a AddressEntry> {
        if instances.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % instances.len();
        instances.get(index)
    }
}

/// Balancer selection as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    UniformRandom,
    WeightedRandom,
    RoundRobin,
}

impl BalancerKind {
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            Self::UniformRandom => Box::new(UniformRandom),
            Self::WeightedRandom => Box::new(WeightedRandom),
            Self::RoundRobin => Box::new(RoundRobin::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entries(weights: &[u32]) -> Vec<AddressEntry> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| AddressEntry::new(format!("hall-{i}"), *w))
            .collect()
    }

    #[test]
    fn empty_slice_yields_none() {
        for kind in [
            BalancerKind::UniformRandom,
            BalancerKind::WeightedRandom,
            BalancerKind::RoundRobin,
        ] {
            assert!(kind.build().pick(&[]).is_none(), "{kind:?}");
        }
    }

    #[test]
    fn uniform_random_reaches_every_instance() {
        let instances = entries(&[1, 1, 1]);
        let balancer = UniformRandom;
        let mut seen = HashMap::new();
        for _ in 0..600 {
            let pick = balancer.pick(&instances).unwrap();
            *seen.entry(pick.addr.clone()).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.values().all(|count| *count > 100), "{seen:?}");
    }

    #[test]
    fn weighted_random_favours_heavy_instances() {
        let instances = entries(&[1, 9]);
        let balancer = WeightedRandom;
        let heavy = (0..1000)
            .filter(|_| balancer.pick(&instances).unwrap().addr == "hall-1")
            .count();
        assert!(heavy > 800, "heavy instance picked {heavy} times");
    }

    #[test]
    fn zero_weight_is_still_reachable() {
        let instances = entries(&[0]);
        assert_eq!(WeightedRandom.pick(&instances).unwrap().addr, "hall-0");
    }

    #[test]
    fn round_robin_cycles() {
        let instances = entries(&[1, 1, 1]);
        let balancer = RoundRobin::default();
        let picks: Vec<_> = (0..6)
            .map(|_| balancer.pick(&instances).unwrap().addr.clone())
            .collect();
        assert_eq!(
            picks,
            ["hall-0", "hall-1", "hall-2", "hall-0", "hall-1", "hall-2"]
        );
    }
}
