//! Construction of a node's stack.
//!
//! Layers are applied in a fixed order, each one switched by configuration:
//! base simulated listener (with a link-breaking authorizer), path
//! multiplexing, edge security, and finally a relay listener for nodes that
//! may be unreachable directly.

use crate::{
    config::SimulationConfig,
    errors::SimulationError,
    node::{coordinates::NcService, path::PathManager, OverlayNode},
    registry::{NodeRecord, NodeRegistry},
    ring::RingAddress,
    security::{HandshakeStyle, SecurityOverlord, TrustManager},
    simulation::SimulationRng,
    transport::{
        listener::{build_stack, with_pathing, with_security},
        Authorizer, BrokenAuthorizer, Listener, RelayOverlap, SimId, StackContext, StackStep,
        TransportAddress,
    },
};

/// Random peers a node is seeded with outside evaluation mode.
pub const MAX_REMOTE_TAS: usize = 5;

pub struct OverlayBootstrapper {
    config: SimulationConfig,
    rng: SimulationRng,
    trust: Option<TrustManager>,
}

impl OverlayBootstrapper {
    pub fn new(config: &SimulationConfig, rng: SimulationRng) -> Result<Self, SimulationError> {
        let trust = if config.is_secure() {
            tracing::info!(bits = config.authority_key_bits, "Creating simulation authority");
            Some(TrustManager::new(config.authority_key_bits, &rng.child())?)
        } else {
            None
        };
        Ok(Self {
            config: config.clone(),
            rng,
            trust,
        })
    }

    pub fn trust(&self) -> Option<&TrustManager> {
        self.trust.as_ref()
    }

    pub fn trust_mut(&mut self) -> Option<&mut TrustManager> {
        self.trust.as_mut()
    }

    fn stack_steps(&self) -> Vec<StackStep> {
        let mut steps: Vec<StackStep> = Vec::new();
        if self.config.pathing {
            steps.push(with_pathing);
        }
        if self.config.secure_edges {
            steps.push(with_security);
        }
        steps
    }

    /// Builds the node for `id` at `address` and adds it to `registry`.
    pub fn bootstrap<'r>(
        &mut self,
        registry: &'r mut NodeRegistry,
        id: SimId,
        address: RingAddress,
    ) -> Result<&'r mut NodeRecord, SimulationError> {
        if registry.contains_id(id) {
            return Err(SimulationError::DuplicateId(id));
        }

        let authorizer: Option<Box<dyn Authorizer>> = (self.config.broken > 0.0 && id.as_u32() > 0)
            .then(|| {
                Box::new(BrokenAuthorizer::new(self.config.broken, self.rng.child()))
                    as Box<dyn Authorizer>
            });
        let base = Listener::simulation(id, authorizer);

        let security = match &mut self.trust {
            Some(trust) => {
                let style = if self.config.dtls {
                    HandshakeStyle::Dtls
                } else {
                    HandshakeStyle::Symmetric
                };
                Some(SecurityOverlord::new(style, trust.handler_for(&address)?))
            }
            None => None,
        };

        let mut path_manager = self.config.pathing.then(|| PathManager::new(id));
        let ctx = StackContext {
            path: path_manager.as_mut().map(PathManager::create_path),
        };
        let listener = build_stack(base, &self.stack_steps(), &ctx);

        let remote_tas = if self.config.evaluation && registry.live_size() == 0 {
            // filled in once every node of the initial ring is registered
            Vec::new()
        } else {
            self.random_remote_tas(registry)
        };

        let mut node = OverlayNode::new(id, address, self.config.node_params(), listener);
        node.set_remote_tas(remote_tas);
        if let Some(security) = security {
            node = node.with_security(security);
        }
        if let Some(pm) = path_manager {
            node = node.with_path_manager(pm);
        }
        let overlap = if self.config.nc_enable {
            node = node.with_coordinates(NcService::new(self.rng.child()));
            RelayOverlap::Coordinates
        } else {
            RelayOverlap::Simple
        };
        if self.config.broken > 0.0 {
            let relay = Listener::relay(overlap);
            let relay = if self.config.secure_edges {
                with_security(relay, &ctx)
            } else {
                relay
            };
            node = node.with_relay_listener(relay);
        }

        tracing::debug!(node = %id, %address, listener = %node.listener(), "Bootstrapped node");
        registry.add(node)
    }

    /// Up to [`MAX_REMOTE_TAS`] registered nodes, plus node 0 whenever links
    /// can break.
    fn random_remote_tas(&self, registry: &NodeRegistry) -> Vec<TransportAddress> {
        let mut candidates: Vec<&NodeRecord> = registry.iter().collect();
        self.rng.shuffle(&mut candidates);
        let mut tas: Vec<TransportAddress> = candidates
            .iter()
            .take(MAX_REMOTE_TAS)
            .map(|r| r.node.transport())
            .collect();
        if self.config.broken > 0.0 && !tas.iter().any(|ta| ta.id() == SimId(0)) {
            let first = registry
                .get_by_id(SimId(0))
                .map(|r| r.node.transport())
                .unwrap_or_else(|| TransportAddress::new(SimId(0)));
            tas.push(first);
        }
        tas
    }
}

/// Ring-neighbor seeds for the initial evaluation topology: the nodes at
/// offsets -2, -1, +1 and +2 in address order.
pub fn evaluation_remote_tas(registry: &NodeRegistry) -> Vec<(SimId, Vec<TransportAddress>)> {
    let ordered: Vec<(SimId, TransportAddress)> = registry
        .iter()
        .map(|r| (r.id, r.node.transport()))
        .collect();
    let n = ordered.len();
    ordered
        .iter()
        .enumerate()
        .map(|(i, (id, _))| {
            let mut tas: Vec<TransportAddress> = Vec::new();
            for offset in [-2isize, -1, 1, 2] {
                let j = (i as isize + offset).rem_euclid(n as isize) as usize;
                let ta = &ordered[j].1;
                if j != i && !tas.contains(ta) {
                    tas.push(ta.clone());
                }
            }
            (*id, tas)
        })
        .collect()
}

impl std::fmt::Debug for OverlayBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayBootstrapper")
            .field("secure", &self.trust.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::subject_name;

    fn config() -> SimulationConfig {
        SimulationConfig {
            pathing: true,
            secure_edges: true,
            broken: 0.5,
            authority_key_bits: 1024,
            ..SimulationConfig::new(4, 11)
        }
    }

    #[test]
    fn layers_follow_configuration() -> testresult::TestResult {
        let config = config();
        let rng = SimulationRng::new(config.seed);
        let mut bootstrapper = OverlayBootstrapper::new(&config, rng.child())?;
        let mut registry = NodeRegistry::new();

        let address = RingAddress::random(&rng);
        let record = bootstrapper.bootstrap(&mut registry, SimId(0), address)?;
        assert_eq!(record.node.listener().to_string(), "secure > path(p0) > sim(0)");
        assert_eq!(record.node.transport().to_string(), "s.sim://0/p0");
        let relay = record.node.relay_listener().ok_or("relay listener")?;
        assert!(relay.is_secure() && relay.is_relay());
        let security = record.node.security().ok_or("security")?;
        assert_eq!(
            security.handler().local_certificate().subject(),
            subject_name(&address)
        );

        let record = bootstrapper.bootstrap(&mut registry, SimId(1), RingAddress::random(&rng))?;
        assert!(record.node.listener().to_string().contains("broken"));
        assert_eq!(record.node.remote_tas().len(), 1);
        assert_eq!(record.node.remote_tas()[0].id(), SimId(0));

        assert!(matches!(
            bootstrapper.bootstrap(&mut registry, SimId(1), RingAddress::random(&rng)),
            Err(SimulationError::DuplicateId(SimId(1)))
        ));
        Ok(())
    }

    #[test]
    fn evaluation_seeds_are_ring_neighbors() -> testresult::TestResult {
        let config = SimulationConfig {
            evaluation: true,
            ..SimulationConfig::new(6, 2)
        };
        let rng = SimulationRng::new(config.seed);
        let mut bootstrapper = OverlayBootstrapper::new(&config, rng.child())?;
        let mut registry = NodeRegistry::new();
        for id in 0..6 {
            let record = bootstrapper.bootstrap(&mut registry, SimId(id), RingAddress::new(u128::from(id) * 100))?;
            assert!(record.node.remote_tas().is_empty());
        }
        let seeds = evaluation_remote_tas(&registry);
        let (id, tas) = &seeds[0];
        assert_eq!(*id, SimId(0));
        let mut ids: Vec<u32> = tas.iter().map(|ta| ta.id().as_u32()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 4, 5]);
        Ok(())
    }
}
