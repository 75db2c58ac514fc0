//! Ring consistency check over the nodes' local connection tables.
//!
//! The walk starts at the smallest registered address and repeatedly steps to
//! the current node's left structured neighbor, requiring that neighbor's own
//! right neighbor to be the node we came from. A ring is complete when the walk
//! returns to its start after visiting every registered node and the registry
//! agrees on how many nodes are live.

use std::{collections::BTreeSet, fmt};

use crate::{registry::NodeRegistry, ring::RingAddress};

/// Something the ring walk could not account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MissingNode {
    /// Registered but never reached by the walk.
    Address(RingAddress),
    /// The registry size differs from the number of live nodes.
    Unaccounted,
    /// The walk stopped before coming back to where it started.
    RingNotClosed,
}

impl fmt::Display for MissingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingNode::Address(address) => write!(f, "{address}"),
            MissingNode::Unaccounted => f.write_str("unaccounted node"),
            MissingNode::RingNotClosed => f.write_str("ring not closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingWalk {
    pub visited: BTreeSet<RingAddress>,
    pub closed: bool,
    /// Where the walk stopped early, and why.
    pub broken_at: Option<(RingAddress, RingDefect)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDefect {
    NoLeftNeighbor,
    /// The left neighbor is not registered.
    UnknownNeighbor(RingAddress),
    /// The left neighbor's right neighbor is someone else.
    Disagreement {
        left: RingAddress,
        left_sees: Option<RingAddress>,
    },
}

pub struct RingVerifier<'a> {
    registry: &'a NodeRegistry,
}

impl<'a> RingVerifier<'a> {
    pub fn new(registry: &'a NodeRegistry) -> Self {
        Self { registry }
    }

    pub fn walk(&self) -> RingWalk {
        let mut visited = BTreeSet::new();
        let Some(start) = self.registry.addresses().next().copied() else {
            return RingWalk {
                visited,
                closed: true,
                broken_at: None,
            };
        };
        let mut current = start;
        visited.insert(start);
        if self.registry.len() == 1 {
            return RingWalk {
                visited,
                closed: true,
                broken_at: None,
            };
        }
        loop {
            let Some(record) = self.registry.get(&current) else {
                break;
            };
            let Some(left) = record.node.left_neighbor().map(|c| c.address()) else {
                return RingWalk {
                    visited,
                    closed: false,
                    broken_at: Some((current, RingDefect::NoLeftNeighbor)),
                };
            };
            let Some(left_record) = self.registry.get(&left) else {
                return RingWalk {
                    visited,
                    closed: false,
                    broken_at: Some((current, RingDefect::UnknownNeighbor(left))),
                };
            };
            let left_sees = left_record.node.right_neighbor().map(|c| c.address());
            if left_sees != Some(current) {
                return RingWalk {
                    visited,
                    closed: false,
                    broken_at: Some((current, RingDefect::Disagreement { left, left_sees })),
                };
            }
            if left == start {
                return RingWalk {
                    visited,
                    closed: true,
                    broken_at: None,
                };
            }
            if !visited.insert(left) || visited.len() > self.registry.len() {
                break;
            }
            current = left;
        }
        RingWalk {
            visited,
            closed: false,
            broken_at: None,
        }
    }

    pub fn check_ring(&self) -> bool {
        let walk = self.walk();
        let count = walk.visited.len();
        if let Some((at, defect)) = walk.broken_at {
            tracing::debug!(%at, ?defect, visited = count, "Ring walk stopped");
        }
        walk.closed && count == self.registry.len() && count == self.registry.live_size()
    }

    /// Registered addresses the walk never reached, plus markers for a ring
    /// that did not close or a live count that does not add up.
    pub fn find_missing(&self) -> BTreeSet<MissingNode> {
        let walk = self.walk();
        let mut missing: BTreeSet<MissingNode> = self
            .registry
            .addresses()
            .filter(|a| !walk.visited.contains(a))
            .map(|a| MissingNode::Address(*a))
            .collect();
        if !walk.closed {
            missing.insert(MissingNode::RingNotClosed);
        }
        if self.registry.live_size() != self.registry.len() {
            missing.insert(MissingNode::Unaccounted);
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::{NodeParams, OverlayNode},
        transport::{Listener, SimId},
    };

    fn registry(addresses: &[u128]) -> testresult::TestResult<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        for (i, raw) in addresses.iter().enumerate() {
            let id = SimId(i as u32);
            let node = OverlayNode::new(
                id,
                RingAddress::new(*raw),
                NodeParams::default(),
                Listener::simulation(id, None),
            );
            registry.add(node)?;
        }
        Ok(registry)
    }

    #[test]
    fn empty_registry_is_a_ring() -> testresult::TestResult {
        let registry = NodeRegistry::new();
        let verifier = RingVerifier::new(&registry);
        assert!(verifier.check_ring());
        assert!(verifier.find_missing().is_empty());
        Ok(())
    }

    #[test]
    fn unlinked_nodes_are_reported_the_same_way_twice() -> testresult::TestResult {
        let mut registry = registry(&[10, 20, 30])?;
        for address in [10, 20, 30].map(RingAddress::new) {
            registry.mark_live(&address);
        }
        let verifier = RingVerifier::new(&registry);
        assert!(!verifier.check_ring());
        let missing = verifier.find_missing();
        assert_eq!(missing, verifier.find_missing());
        assert!(missing.contains(&MissingNode::RingNotClosed));
        assert!(missing.contains(&MissingNode::Address(RingAddress::new(20))));
        assert!(!missing.contains(&MissingNode::Address(RingAddress::new(10))));
        assert!(!missing.contains(&MissingNode::Unaccounted));
        Ok(())
    }

    #[test]
    fn unstarted_nodes_are_unaccounted() -> testresult::TestResult {
        let registry = registry(&[10])?;
        let verifier = RingVerifier::new(&registry);
        assert!(verifier.find_missing().contains(&MissingNode::Unaccounted));
        assert!(!verifier.check_ring());
        Ok(())
    }
}
