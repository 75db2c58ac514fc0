use std::{collections::HashMap, fmt};

use crate::simulation::SimulationRng;

use super::{SimId, TransportAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Decides whether a direct link with a remote endpoint may be formed.
pub trait Authorizer: fmt::Debug {
    fn authorize(&mut self, remote: &TransportAddress) -> Decision;
}

/// Denies direct links with a fixed probability, remembering the outcome per
/// remote so the same pair never flips. Id 0 is always reachable so the
/// overlay keeps a connected seed.
#[derive(Debug)]
pub struct BrokenAuthorizer {
    probability: f64,
    decisions: HashMap<SimId, Decision>,
    rng: SimulationRng,
}

impl BrokenAuthorizer {
    pub fn new(probability: f64, rng: SimulationRng) -> Self {
        Self {
            probability,
            decisions: HashMap::new(),
            rng,
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl Authorizer for BrokenAuthorizer {
    fn authorize(&mut self, remote: &TransportAddress) -> Decision {
        if remote.id() == SimId(0) {
            return Decision::Allow;
        }
        let probability = self.probability;
        let rng = &self.rng;
        *self.decisions.entry(remote.id()).or_insert_with(|| {
            if rng.gen_f64() > probability {
                Decision::Allow
            } else {
                Decision::Deny
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_node_is_always_allowed() {
        let mut auth = BrokenAuthorizer::new(1.0, SimulationRng::new(5));
        assert_eq!(
            auth.authorize(&TransportAddress::new(SimId(0))),
            Decision::Allow
        );
        for id in 1..20 {
            assert_eq!(
                auth.authorize(&TransportAddress::new(SimId(id))),
                Decision::Deny
            );
        }
    }

    #[test]
    fn decisions_are_cached_per_remote() {
        let mut auth = BrokenAuthorizer::new(0.5, SimulationRng::new(9));
        let first: Vec<_> = (1..50)
            .map(|id| auth.authorize(&TransportAddress::new(SimId(id))))
            .collect();
        let again: Vec<_> = (1..50)
            .map(|id| auth.authorize(&TransportAddress::with_path(SimId(id), "p0")))
            .collect();
        assert_eq!(first, again);
        assert!(first.contains(&Decision::Allow));
        assert!(first.contains(&Decision::Deny));
    }

    #[test]
    fn zero_probability_never_denies() {
        let mut auth = BrokenAuthorizer::new(0.0, SimulationRng::new(1));
        assert!((1..100)
            .all(|id| auth.authorize(&TransportAddress::new(SimId(id))) == Decision::Allow));
    }
}
