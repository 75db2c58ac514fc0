//! Bookkeeping of the simulated nodes.
//!
//! [`NodeRegistry`] owns every [`NodeRecord`] and indexes it both by ring
//! address and by simulation id. [`AddressSpace`] hands out ids and addresses
//! that are free in a given registry.

use std::collections::BTreeMap;

use crate::{
    errors::SimulationError,
    node::OverlayNode,
    ring::RingAddress,
    simulation::SimulationRng,
    transport::SimId,
};

/// Attempts at drawing a free ring address before giving up.
pub const MAX_ADDRESS_ATTEMPTS: usize = 64;

#[derive(Debug)]
pub struct NodeRecord {
    pub id: SimId,
    pub address: RingAddress,
    pub node: OverlayNode,
    started: bool,
}

impl NodeRecord {
    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    by_address: BTreeMap<RingAddress, NodeRecord>,
    by_id: BTreeMap<SimId, RingAddress>,
    live: usize,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: OverlayNode) -> Result<&mut NodeRecord, SimulationError> {
        let id = node.sim_id();
        let address = node.address();
        if self.by_id.contains_key(&id) {
            return Err(SimulationError::DuplicateId(id));
        }
        if self.by_address.contains_key(&address) {
            return Err(SimulationError::DuplicateAddress(address));
        }
        self.by_id.insert(id, address);
        let record = self.by_address.entry(address).or_insert(NodeRecord {
            id,
            address,
            node,
            started: false,
        });
        Ok(record)
    }

    /// Counts the node towards the live network size. Idempotent.
    pub fn mark_live(&mut self, address: &RingAddress) -> bool {
        match self.by_address.get_mut(address) {
            Some(record) if !record.started => {
                record.started = true;
                self.live += 1;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, address: &RingAddress) -> Result<NodeRecord, SimulationError> {
        let record = self
            .by_address
            .remove(address)
            .ok_or_else(|| SimulationError::UnknownNode(address.to_string()))?;
        self.by_id.remove(&record.id);
        if record.started {
            self.live -= 1;
        }
        Ok(record)
    }

    pub fn get(&self, address: &RingAddress) -> Option<&NodeRecord> {
        self.by_address.get(address)
    }

    pub fn get_mut(&mut self, address: &RingAddress) -> Option<&mut NodeRecord> {
        self.by_address.get_mut(address)
    }

    pub fn get_by_id(&self, id: SimId) -> Option<&NodeRecord> {
        self.by_id.get(&id).and_then(|a| self.by_address.get(a))
    }

    pub fn get_by_id_mut(&mut self, id: SimId) -> Option<&mut NodeRecord> {
        let address = *self.by_id.get(&id)?;
        self.by_address.get_mut(&address)
    }

    pub fn contains_id(&self, id: SimId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn contains_address(&self, address: &RingAddress) -> bool {
        self.by_address.contains_key(address)
    }

    /// Record at position `index` in ring-address order.
    pub fn index(&self, index: usize) -> Result<&NodeRecord, SimulationError> {
        self.by_address
            .values()
            .nth(index)
            .ok_or(SimulationError::NoSuchIndex(index))
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Nodes that have been started and not removed since.
    pub fn live_size(&self) -> usize {
        self.live
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.by_address.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeRecord> {
        self.by_address.values_mut()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &RingAddress> {
        self.by_address.keys()
    }

    pub fn ids(&self) -> impl Iterator<Item = SimId> + '_ {
        self.by_id.keys().copied()
    }

    pub(crate) fn drain(&mut self) -> Vec<NodeRecord> {
        self.by_id.clear();
        self.live = 0;
        std::mem::take(&mut self.by_address).into_values().collect()
    }
}

/// Allocator of simulation ids and ring addresses.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    rng: SimulationRng,
}

impl AddressSpace {
    pub fn new(rng: SimulationRng) -> Self {
        Self { rng }
    }

    /// First free id, starting at the registry size and falling back to
    /// random probes when that one is taken.
    pub fn allocate_id(&self, registry: &NodeRegistry) -> SimId {
        let len = registry.len();
        let mut candidate = SimId(len as u32);
        while registry.contains_id(candidate) {
            candidate = SimId(self.rng.gen_range(0..2 * len + 2) as u32);
        }
        candidate
    }

    pub fn generate_address(&self, registry: &NodeRegistry) -> Result<RingAddress, SimulationError> {
        for _ in 0..MAX_ADDRESS_ATTEMPTS {
            let address = RingAddress::random(&self.rng);
            if !registry.contains_address(&address) {
                return Ok(address);
            }
        }
        Err(SimulationError::AddressSpaceExhausted {
            attempts: MAX_ADDRESS_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{node::NodeParams, transport::Listener};

    fn node(id: u32, address: RingAddress) -> OverlayNode {
        OverlayNode::new(
            SimId(id),
            address,
            NodeParams::default(),
            Listener::simulation(SimId(id), None),
        )
    }

    #[test]
    fn ids_and_addresses_are_fresh() -> testresult::TestResult {
        let space = AddressSpace::new(SimulationRng::new(3));
        let mut registry = NodeRegistry::new();
        let mut ids = BTreeSet::new();
        for _ in 0..50 {
            let id = space.allocate_id(&registry);
            let address = space.generate_address(&registry)?;
            assert!(ids.insert(id));
            registry.add(node(id.as_u32(), address))?;
        }
        assert_eq!(registry.len(), 50);
        Ok(())
    }

    #[test]
    fn allocation_skips_taken_ids() -> testresult::TestResult {
        let space = AddressSpace::new(SimulationRng::new(5));
        let mut registry = NodeRegistry::new();
        registry.add(node(1, RingAddress::new(10)))?;
        let id = space.allocate_id(&registry);
        assert_ne!(id, SimId(1));
        registry.add(node(id.as_u32(), RingAddress::new(20)))?;
        assert_ne!(space.allocate_id(&registry), SimId(1));
        Ok(())
    }

    #[test]
    fn duplicates_are_rejected() -> testresult::TestResult {
        let mut registry = NodeRegistry::new();
        registry.add(node(0, RingAddress::new(10)))?;
        assert!(matches!(
            registry.add(node(0, RingAddress::new(12))),
            Err(SimulationError::DuplicateId(SimId(0)))
        ));
        assert!(matches!(
            registry.add(node(1, RingAddress::new(10))),
            Err(SimulationError::DuplicateAddress(_))
        ));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn remove_unindexes_both_views() -> testresult::TestResult {
        let mut registry = NodeRegistry::new();
        let a = RingAddress::new(10);
        let b = RingAddress::new(20);
        registry.add(node(0, a))?;
        registry.add(node(1, b))?;
        registry.mark_live(&a);
        registry.mark_live(&b);
        assert!(!registry.mark_live(&b));
        assert_eq!(registry.live_size(), 2);

        registry.remove(&a)?;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_size(), 1);
        assert!(registry.get(&a).is_none());
        assert!(registry.get_by_id(SimId(0)).is_none());

        assert!(registry.remove(&a).is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.index(0)?.id, SimId(1));
        assert!(registry.index(1).is_err());
        Ok(())
    }
}
