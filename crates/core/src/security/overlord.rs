use std::collections::BTreeMap;

use super::certificate::{subject_name, CertificateHandler};
use crate::{node::rpc::CallId, ring::RingAddress};

/// Handshake used to establish a security association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStyle {
    /// Certificate exchange in one round trip.
    Symmetric,
    /// Cookie exchange followed by certificate exchange, two round trips.
    Dtls,
}

impl HandshakeStyle {
    /// Stage number of the message that completes the handshake.
    pub fn final_stage(self) -> u8 {
        match self {
            HandshakeStyle::Symmetric => 1,
            HandshakeStyle::Dtls => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Association {
    /// Handshake in flight; calls wait here until it completes.
    Pending { started_at: u64, queued: Vec<CallId> },
    Established { subject: String, since: u64 },
}

/// Per-node manager of security associations with remote addresses.
#[derive(Debug)]
pub struct SecurityOverlord {
    style: HandshakeStyle,
    handler: CertificateHandler,
    associations: BTreeMap<RingAddress, Association>,
}

impl SecurityOverlord {
    pub fn new(style: HandshakeStyle, handler: CertificateHandler) -> Self {
        Self {
            style,
            handler,
            associations: BTreeMap::new(),
        }
    }

    pub fn style(&self) -> HandshakeStyle {
        self.style
    }

    pub fn handler(&self) -> &CertificateHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut CertificateHandler {
        &mut self.handler
    }

    pub fn association(&self, remote: &RingAddress) -> Option<&Association> {
        self.associations.get(remote)
    }

    pub fn is_established(&self, remote: &RingAddress) -> bool {
        matches!(
            self.associations.get(remote),
            Some(Association::Established { .. })
        )
    }

    /// Queues `call` behind the association with `remote`. Returns true if a
    /// new handshake has to be started.
    pub fn enqueue(&mut self, remote: RingAddress, call: CallId, now: u64) -> bool {
        match self.associations.get_mut(&remote) {
            Some(Association::Pending { queued, .. }) => {
                queued.push(call);
                false
            }
            Some(Association::Established { .. }) => false,
            None => {
                self.associations.insert(
                    remote,
                    Association::Pending {
                        started_at: now,
                        queued: vec![call],
                    },
                );
                true
            }
        }
    }

    /// Records the responder side of a handshake.
    pub fn accept(&mut self, remote: RingAddress, now: u64) {
        if !self.is_established(&remote) {
            self.associations
                .entry(remote)
                .or_insert(Association::Pending {
                    started_at: now,
                    queued: Vec::new(),
                });
        }
    }

    /// Marks the association established, returning the calls that waited on it.
    pub fn establish(&mut self, remote: RingAddress, now: u64) -> Vec<CallId> {
        let previous = self.associations.insert(
            remote,
            Association::Established {
                subject: subject_name(&remote),
                since: now,
            },
        );
        match previous {
            Some(Association::Pending { queued, .. }) => queued,
            _ => Vec::new(),
        }
    }

    /// Drops a pending association whose handshake did not finish in time.
    pub fn expire(&mut self, remote: &RingAddress) -> Option<Vec<CallId>> {
        match self.associations.get(remote) {
            Some(Association::Pending { .. }) => match self.associations.remove(remote) {
                Some(Association::Pending { queued, .. }) => Some(queued),
                _ => None,
            },
            _ => None,
        }
    }

    /// Closes every association whose remote maps to `subject`.
    pub fn close_subject(&mut self, subject: &str) -> Vec<(RingAddress, Vec<CallId>)> {
        let closing: Vec<_> = self
            .associations
            .keys()
            .filter(|addr| subject_name(addr) == subject)
            .copied()
            .collect();
        closing
            .into_iter()
            .filter_map(|addr| {
                let queued = match self.associations.remove(&addr)? {
                    Association::Pending { queued, .. } => queued,
                    Association::Established { .. } => Vec::new(),
                };
                Some((addr, queued))
            })
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.associations
            .values()
            .filter(|a| matches!(a, Association::Established { .. }))
            .count()
    }
}
