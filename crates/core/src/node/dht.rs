//! Replicated key/value table.
//!
//! Every key maps to `2^degree` points spread evenly around the ring starting
//! at the key's hash. Puts and gets are sent greedily to each point and land
//! on whichever node is closest. A put succeeds when a majority of replicas
//! acknowledge it; a get streams every distinct value as replicas answer.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use futures::channel::{mpsc, oneshot};
use serde::{Deserialize, Serialize};

use crate::{ring::RingAddress, simulation::time::nanos};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtValue {
    pub value: Vec<u8>,
    /// Time left before the replica forgets the value.
    pub expires_in: Duration,
}

/// Ring points responsible for `key`.
pub fn replica_addresses(key: &[u8], degree: u32) -> Vec<RingAddress> {
    let base = RingAddress::from_hash(key);
    let count = 1u128 << degree;
    let step = if degree == 0 { 0 } else { 1u128 << (128 - degree) };
    (0..count)
        .map(|i| RingAddress::from_bytes(base.wrapping_add(step * i).to_bytes()))
        .collect()
}

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    expires_at: u64,
}

/// Values stored at this node on behalf of the ring.
#[derive(Debug, Default)]
pub struct TableServer {
    entries: BTreeMap<Vec<u8>, Vec<Stored>>,
}

impl TableServer {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, expires_at: u64) {
        let values = self.entries.entry(key).or_default();
        match values.iter_mut().find(|s| s.value == value) {
            Some(existing) => existing.expires_at = existing.expires_at.max(expires_at),
            None => values.push(Stored { value, expires_at }),
        }
    }

    pub fn get(&mut self, key: &[u8], now: u64) -> Vec<DhtValue> {
        self.prune(now);
        self.entries
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .map(|s| DhtValue {
                        value: s.value.clone(),
                        expires_in: Duration::from_nanos(s.expires_at - now),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops expired values.
    pub fn prune(&mut self, now: u64) {
        self.entries.retain(|_, values| {
            values.retain(|s| s.expires_at > now);
            !values.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn expiry(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(nanos(ttl))
}

#[derive(Debug)]
pub(crate) enum DhtOp {
    Put {
        outstanding: usize,
        acks: usize,
        replicas: usize,
        sink: Option<oneshot::Sender<bool>>,
    },
    Get {
        outstanding: usize,
        seen: BTreeSet<Vec<u8>>,
        sink: mpsc::UnboundedSender<DhtValue>,
    },
}

/// Client side bookkeeping of in-flight operations issued by this node.
#[derive(Debug)]
pub(crate) struct DhtClient {
    degree: u32,
    next_op: u64,
    ops: BTreeMap<u64, DhtOp>,
}

impl DhtClient {
    pub fn new(degree: u32) -> Self {
        Self {
            degree,
            next_op: 0,
            ops: BTreeMap::new(),
        }
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    pub fn start(&mut self, op: DhtOp) -> u64 {
        let id = self.next_op;
        self.next_op += 1;
        self.ops.insert(id, op);
        id
    }

    /// Records one replica's answer. The operation is finished, and its sink
    /// resolved or closed, once every replica has answered or failed.
    pub fn record(&mut self, op: u64, ack: bool, values: Vec<DhtValue>) {
        let finished = match self.ops.get_mut(&op) {
            Some(DhtOp::Put {
                outstanding, acks, ..
            }) => {
                *outstanding = outstanding.saturating_sub(1);
                if ack {
                    *acks += 1;
                }
                *outstanding == 0
            }
            Some(DhtOp::Get {
                outstanding,
                seen,
                sink,
            }) => {
                for value in values {
                    if seen.insert(value.value.clone()) {
                        let _ = sink.unbounded_send(value);
                    }
                }
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            }
            None => false,
        };
        if finished {
            self.finish(op);
        }
    }

    fn finish(&mut self, op: u64) {
        if let Some(DhtOp::Put {
            acks,
            replicas,
            sink: Some(sink),
            ..
        }) = self.ops.remove(&op)
        {
            if acks > replicas / 2 {
                let _ = sink.send(true);
            }
            // a dropped sender reports failure to the waiting caller
        }
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ProxyEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ttl: Duration,
}

/// Values a remote caller asked this node to keep alive in the table by
/// re-putting them every half ttl.
#[derive(Debug, Default)]
pub(crate) struct DhtProxy {
    next: u64,
    entries: BTreeMap<u64, ProxyEntry>,
}

impl DhtProxy {
    /// Registers an entry. Returns its id when a refresh needs scheduling,
    /// `None` when an existing registration was only updated.
    pub fn register(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> Option<u64> {
        if let Some(existing) = self
            .entries
            .values_mut()
            .find(|e| e.key == key && e.value == value)
        {
            existing.ttl = ttl;
            return None;
        }
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, ProxyEntry { key, value, ttl });
        Some(id)
    }

    pub fn unregister(&mut self, key: &[u8], value: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| !(e.key == key && e.value == value));
        self.entries.len() < before
    }

    pub fn get(&self, id: u64) -> Option<&ProxyEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) fn refresh_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_millis(100))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn replicas_are_spread_evenly() {
        let points = replica_addresses(b"key", 3);
        assert_eq!(points.len(), 8);
        for pair in points.windows(2) {
            let gap = pair[0].clockwise_distance(&pair[1]);
            assert!(gap.abs_diff(1u128 << 125) <= 1);
        }
        assert!(points.iter().all(RingAddress::is_structured_class));
        assert_eq!(replica_addresses(b"key", 0).len(), 1);
    }

    #[test]
    fn table_server_expires_values() {
        let mut table = TableServer::default();
        table.put(b"k".to_vec(), b"a".to_vec(), 100);
        table.put(b"k".to_vec(), b"b".to_vec(), 50);
        table.put(b"k".to_vec(), b"a".to_vec(), 80);
        assert_eq!(table.len(), 2);

        let values = table.get(b"k", 60);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, b"a");
        assert_eq!(values[0].expires_in, Duration::from_nanos(40));
        assert!(table.get(b"k", 100).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn put_needs_a_majority() {
        let mut client = DhtClient::new(2);
        let (tx, mut rx) = oneshot::channel();
        let op = client.start(DhtOp::Put {
            outstanding: 4,
            acks: 0,
            replicas: 4,
            sink: Some(tx),
        });
        client.record(op, true, vec![]);
        client.record(op, true, vec![]);
        client.record(op, false, vec![]);
        assert_eq!(rx.try_recv(), Ok(None));
        client.record(op, false, vec![]);
        // two of four is not a majority
        assert!(rx.try_recv().is_err());
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn get_streams_distinct_values_then_closes() {
        let mut client = DhtClient::new(1);
        let (tx, mut rx) = mpsc::unbounded();
        let op = client.start(DhtOp::Get {
            outstanding: 2,
            seen: BTreeSet::new(),
            sink: tx,
        });
        let value = |v: &[u8]| DhtValue {
            value: v.to_vec(),
            expires_in: Duration::from_secs(1),
        };
        client.record(op, true, vec![value(b"x")]);
        client.record(op, true, vec![value(b"x"), value(b"y")]);
        let received: Vec<_> = futures::executor::block_on(rx.by_ref().collect::<Vec<_>>());
        assert_eq!(
            received.into_iter().map(|v| v.value).collect::<Vec<_>>(),
            vec![b"x".to_vec(), b"y".to_vec()]
        );
    }

    #[test]
    fn proxy_deduplicates_registrations() {
        let mut proxy = DhtProxy::default();
        assert!(proxy
            .register(b"k".to_vec(), b"v".to_vec(), Duration::from_secs(4))
            .is_some());
        assert!(proxy
            .register(b"k".to_vec(), b"v".to_vec(), Duration::from_secs(8))
            .is_none());
        assert_eq!(proxy.len(), 1);
        assert!(proxy.unregister(b"k", b"v"));
        assert!(!proxy.unregister(b"k", b"v"));
        assert_eq!(refresh_interval(Duration::ZERO), Duration::from_millis(100));
    }
}
