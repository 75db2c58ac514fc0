use std::{collections::BTreeMap, fmt, ops::Bound};

use serde::{Deserialize, Serialize};

use super::RingAddress;
use crate::transport::{SimId, TransportAddress};

/// Role of a link in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Bootstrap link to an arbitrary known peer, not part of the ring.
    Leaf,
    /// Long-range structured link.
    Shortcut,
    /// Structured link to one of the nearest peers on either side.
    StructuredNear,
}

impl ConnectionKind {
    pub fn is_structured(self) -> bool {
        !matches!(self, ConnectionKind::Leaf)
    }
}

/// What a node knows about how to reach another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: RingAddress,
    pub transport: TransportAddress,
}

impl PeerInfo {
    pub fn sim_id(&self) -> SimId {
        self.transport.id()
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub peer: PeerInfo,
    pub kind: ConnectionKind,
    /// Relay the edge is tunnelled through, if not direct.
    pub via: Option<SimId>,
    pub established_at: u64,
}

impl Connection {
    pub fn address(&self) -> RingAddress {
        self.peer.address
    }

    pub fn sim_id(&self) -> SimId {
        self.peer.sim_id()
    }

    pub fn is_direct(&self) -> bool {
        self.via.is_none()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} at {}",
            self.kind, self.peer.address, self.peer.transport
        )?;
        if let Some(via) = self.via {
            write!(f, " via {via}")?;
        }
        Ok(())
    }
}

/// Connections of a single node, keyed and ordered by remote ring address.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    by_address: BTreeMap<RingAddress, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. An existing link to the same address keeps the
    /// strongest kind and a direct path over a relayed one.
    pub fn insert(&mut self, conn: Connection) -> bool {
        match self.by_address.get_mut(&conn.address()) {
            Some(existing) => {
                let mut changed = false;
                if conn.kind > existing.kind {
                    existing.kind = conn.kind;
                    changed = true;
                }
                if existing.via.is_some() && conn.via.is_none() {
                    existing.via = None;
                    existing.peer = conn.peer;
                    changed = true;
                }
                changed
            }
            None => {
                self.by_address.insert(conn.address(), conn);
                true
            }
        }
    }

    pub fn remove(&mut self, address: &RingAddress) -> Option<Connection> {
        self.by_address.remove(address)
    }

    /// Drops every connection to the given simulation id, returning them.
    pub fn remove_by_sim_id(&mut self, id: SimId) -> Vec<Connection> {
        let addresses: Vec<_> = self
            .by_address
            .values()
            .filter(|c| c.sim_id() == id || c.via == Some(id))
            .map(Connection::address)
            .collect();
        addresses
            .iter()
            .filter_map(|a| self.by_address.remove(a))
            .collect()
    }

    pub fn get(&self, address: &RingAddress) -> Option<&Connection> {
        self.by_address.get(address)
    }

    pub fn contains(&self, address: &RingAddress) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn by_sim_id(&self, id: SimId) -> Option<&Connection> {
        self.by_address.values().find(|c| c.sim_id() == id)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.by_address.values()
    }

    pub fn structured(&self) -> impl Iterator<Item = &Connection> {
        self.iter().filter(|c| c.kind.is_structured())
    }

    pub fn clear(&mut self) -> Vec<Connection> {
        std::mem::take(&mut self.by_address).into_values().collect()
    }

    /// Structured connections walking clockwise from `address` (exclusive),
    /// wrapping around the ring.
    pub fn clockwise_from<'a>(
        &'a self,
        address: &RingAddress,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        let after = self
            .by_address
            .range((Bound::Excluded(*address), Bound::Unbounded));
        let before = self.by_address.range(..*address);
        after
            .chain(before)
            .map(|(_, c)| c)
            .filter(|c| c.kind.is_structured())
    }

    /// Structured connections walking counter-clockwise from `address`
    /// (exclusive), wrapping around the ring.
    pub fn counter_clockwise_from<'a>(
        &'a self,
        address: &RingAddress,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        let before = self.by_address.range(..*address).rev();
        let after = self
            .by_address
            .range((Bound::Excluded(*address), Bound::Unbounded))
            .rev();
        before
            .chain(after)
            .map(|(_, c)| c)
            .filter(|c| c.kind.is_structured())
    }

    /// Nearest structured connection clockwise of `address`.
    pub fn right_of(&self, address: &RingAddress) -> Option<&Connection> {
        self.clockwise_from(address).next()
    }

    /// Nearest structured connection counter-clockwise of `address`.
    pub fn left_of(&self, address: &RingAddress) -> Option<&Connection> {
        self.counter_clockwise_from(address).next()
    }

    /// Connection with the smallest ring distance to `target`, of any kind.
    pub fn closest_to(
        &self,
        target: &RingAddress,
        exclude: Option<&RingAddress>,
    ) -> Option<&Connection> {
        self.iter()
            .filter(|c| Some(&c.address()) != exclude)
            .min_by_key(|c| c.address().distance(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(raw: u128, kind: ConnectionKind) -> Connection {
        Connection {
            peer: PeerInfo {
                address: RingAddress::new(raw),
                transport: TransportAddress::new(SimId(raw as u32)),
            },
            kind,
            via: None,
            established_at: 0,
        }
    }

    #[test]
    fn neighbors_wrap_and_skip_leafs() {
        let mut table = ConnectionTable::new();
        table.insert(conn(10, ConnectionKind::StructuredNear));
        table.insert(conn(20, ConnectionKind::Leaf));
        table.insert(conn(30, ConnectionKind::Shortcut));
        table.insert(conn(40, ConnectionKind::StructuredNear));

        let me = RingAddress::new(15);
        assert_eq!(table.right_of(&me).unwrap().address(), RingAddress::new(30));
        assert_eq!(table.left_of(&me).unwrap().address(), RingAddress::new(10));

        let high = RingAddress::new(50);
        assert_eq!(table.right_of(&high).unwrap().address(), RingAddress::new(10));
        assert_eq!(table.left_of(&high).unwrap().address(), RingAddress::new(40));

        let low = RingAddress::new(4);
        assert_eq!(table.left_of(&low).unwrap().address(), RingAddress::new(40));
    }

    #[test]
    fn insert_upgrades_but_never_downgrades() {
        let mut table = ConnectionTable::new();
        assert!(table.insert(conn(10, ConnectionKind::Leaf)));
        assert!(table.insert(conn(10, ConnectionKind::StructuredNear)));
        assert!(!table.insert(conn(10, ConnectionKind::Shortcut)));
        assert_eq!(
            table.get(&RingAddress::new(10)).unwrap().kind,
            ConnectionKind::StructuredNear
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn closest_honours_exclusion() {
        let mut table = ConnectionTable::new();
        table.insert(conn(100, ConnectionKind::Leaf));
        table.insert(conn(300, ConnectionKind::Leaf));
        let target = RingAddress::new(110);
        assert_eq!(
            table.closest_to(&target, None).unwrap().address(),
            RingAddress::new(100)
        );
        assert_eq!(
            table
                .closest_to(&target, Some(&RingAddress::new(100)))
                .unwrap()
                .address(),
            RingAddress::new(300)
        );
    }

    #[test]
    fn removing_a_relay_drops_tunnelled_edges() {
        let mut table = ConnectionTable::new();
        table.insert(conn(10, ConnectionKind::StructuredNear));
        let mut relayed = conn(20, ConnectionKind::StructuredNear);
        relayed.via = Some(SimId(10));
        table.insert(relayed);
        let dropped = table.remove_by_sim_id(SimId(10));
        assert_eq!(dropped.len(), 2);
        assert!(table.is_empty());
    }
}
