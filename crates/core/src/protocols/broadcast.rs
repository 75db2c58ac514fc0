//! Spanning-tree broadcast over the ring.
//!
//! A node responsible for the clockwise arc `[from, to]` picks forwarders
//! among its structured connections inside the arc and splits the arc between
//! them: each forwarder covers from just past itself up to just before the
//! next forwarder, the last one up to `to`. The root starts with the whole
//! ring except itself.
//!
//! [`BroadcastHelper`] is the driver side: it collects one receipt per reached
//! node and decides the broadcast is over after a quiet window with no new
//! receipts.

use std::{fmt, fs::OpenOptions, io::Write, path::Path, time::Duration};

use serde::Serialize;

use crate::{
    ring::{Connection, ConnectionTable, RingAddress},
    simulation::time::nanos,
    stats::{average, standard_deviation},
    transport::SimId,
};

/// A connection selected to carry part of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub sim_id: SimId,
    pub via: Option<SimId>,
    pub address: RingAddress,
    pub from: RingAddress,
    pub to: RingAddress,
}

/// Forwarder selection for one hop of a broadcast.
pub struct BroadcastSender;

impl BroadcastSender {
    /// Splits `[from, to]` among the structured connections of `table` inside
    /// it. `forwarders` caps the fan-out; `None` uses every candidate.
    pub fn targets(
        table: &ConnectionTable,
        from: &RingAddress,
        to: &RingAddress,
        forwarders: Option<usize>,
    ) -> Vec<BroadcastTarget> {
        let mut in_range: Vec<&Connection> = table
            .structured()
            .filter(|c| c.address().is_within(from, to))
            .collect();
        in_range.sort_by_key(|c| from.clockwise_distance(&c.address()));

        let selected: Vec<&Connection> = match forwarders {
            Some(f) if f > 0 && in_range.len() > f => {
                let len = in_range.len();
                (0..f).map(|i| in_range[i * len / f]).collect()
            }
            _ => in_range,
        };

        selected
            .iter()
            .enumerate()
            .map(|(i, conn)| BroadcastTarget {
                sim_id: conn.sim_id(),
                via: conn.via,
                address: conn.address(),
                from: conn.address().wrapping_add(1),
                to: selected
                    .get(i + 1)
                    .map(|next| next.address().wrapping_sub(1))
                    .unwrap_or(*to),
            })
            .collect()
    }
}

/// Report a reached node sends back to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReceipt {
    pub receiver: SimId,
    pub address: RingAddress,
    /// How many nodes this receiver forwarded to.
    pub sent_to: usize,
    /// Hop distance from the root.
    pub hops: u32,
}

/// State of one broadcast round on the driver side.
#[derive(Debug, Clone)]
pub struct BroadcastHelper {
    root: SimId,
    forwarders: Option<usize>,
    window: Duration,
    started_at: u64,
    deadline: u64,
    last_receipt_at: u64,
    root_sent_to: usize,
    receipts: Vec<BroadcastReceipt>,
}

impl BroadcastHelper {
    pub fn new(root: SimId, forwarders: Option<usize>, window: Duration, now: u64) -> Self {
        Self {
            root,
            forwarders,
            window,
            started_at: now,
            deadline: now.saturating_add(nanos(window)),
            last_receipt_at: now,
            root_sent_to: 0,
            receipts: Vec::new(),
        }
    }

    pub fn set_root_sent_to(&mut self, sent_to: usize) {
        self.root_sent_to = sent_to;
    }

    /// Records a receipt and pushes the deadline a full window past `now`.
    pub fn record(&mut self, now: u64, receipt: BroadcastReceipt) {
        self.receipts.push(receipt);
        self.last_receipt_at = now;
        self.deadline = now.saturating_add(nanos(self.window));
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    pub fn receipts(&self) -> &[BroadcastReceipt] {
        &self.receipts
    }

    /// Appends one `<responder sim id>, <hops>` line per receipt.
    pub fn write_results(&self, path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for receipt in &self.receipts {
            writeln!(file, "{}, {}", receipt.receiver, receipt.hops)?;
        }
        Ok(())
    }

    /// Statistics over the hop counts of every receipt plus the root's own
    /// zero-hop record. Fan-out figures are kept alongside.
    pub fn finish(self) -> BroadcastStats {
        let hops: Vec<f64> = self
            .receipts
            .iter()
            .map(|r| f64::from(r.hops))
            .chain(std::iter::once(0.0))
            .collect();
        let average_hops = average(&hops);
        let stddev_hops = standard_deviation(&hops, average_hops);

        let fanouts: Vec<f64> = self
            .receipts
            .iter()
            .map(|r| r.sent_to as f64)
            .chain(std::iter::once(self.root_sent_to as f64))
            .collect();
        let average_sent_to = average(&fanouts);
        BroadcastStats {
            root: self.root,
            forwarders: self.forwarders,
            hits: self.receipts.len(),
            max_hops: self.receipts.iter().map(|r| r.hops).max().unwrap_or(0),
            slowest: Duration::from_nanos(self.last_receipt_at - self.started_at),
            average_hops,
            stddev_hops,
            average_sent_to,
            stddev_sent_to: standard_deviation(&fanouts, average_sent_to),
            root_sent_to: self.root_sent_to,
            receipts: self.receipts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub root: SimId,
    pub forwarders: Option<usize>,
    /// Nodes reached, the root excluded.
    pub hits: usize,
    pub max_hops: u32,
    /// Time from start until the last receipt arrived.
    pub slowest: Duration,
    /// Mean hop count, the root counted at zero hops.
    pub average_hops: f64,
    pub stddev_hops: f64,
    pub average_sent_to: f64,
    pub stddev_sent_to: f64,
    pub root_sent_to: usize,
    pub receipts: Vec<BroadcastReceipt>,
}

impl fmt::Display for BroadcastStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Average: {:.3}, Stddev: {:.3}",
            self.average_hops, self.stddev_hops
        )?;
        writeln!(
            f,
            "Fan-out average: {:.3}, Stddev: {:.3}",
            self.average_sent_to, self.stddev_sent_to
        )?;
        write!(
            f,
            "Hit: {}, in: {:?}, max hops: {}",
            self.hits, self.slowest, self.max_hops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ring::{ConnectionKind, PeerInfo},
        transport::TransportAddress,
    };

    fn table(addresses: &[u128]) -> ConnectionTable {
        let mut table = ConnectionTable::new();
        for &raw in addresses {
            table.insert(Connection {
                peer: PeerInfo {
                    address: RingAddress::new(raw),
                    transport: TransportAddress::new(SimId(raw as u32)),
                },
                kind: ConnectionKind::StructuredNear,
                via: None,
                established_at: 0,
            });
        }
        table
    }

    #[test]
    fn root_splits_the_ring_among_forwarders() {
        let table = table(&[10, 20, 30, 40, 50, 60]);
        let root = RingAddress::new(0);
        let targets = BroadcastSender::targets(
            &table,
            &root.wrapping_add(1),
            &root.wrapping_sub(1),
            Some(3),
        );
        let picked: Vec<_> = targets.iter().map(|t| t.address.as_u128()).collect();
        assert_eq!(picked, vec![10, 30, 50]);
        assert_eq!(targets[0].from.as_u128(), 11);
        assert_eq!(targets[0].to.as_u128(), 29);
        assert_eq!(targets[1].to.as_u128(), 49);
        assert_eq!(targets[2].to, root.wrapping_sub(1));
    }

    #[test]
    fn only_connections_inside_the_arc_are_used() {
        let table = table(&[10, 20, 30, 40]);
        let targets = BroadcastSender::targets(
            &table,
            &RingAddress::new(15),
            &RingAddress::new(35),
            None,
        );
        let picked: Vec<_> = targets.iter().map(|t| t.address.as_u128()).collect();
        assert_eq!(picked, vec![20, 30]);
        assert_eq!(targets[1].to.as_u128(), 35);
    }

    #[test]
    fn quiet_window_moves_with_each_receipt() {
        let window = Duration::from_secs(1);
        let mut helper = BroadcastHelper::new(SimId(0), Some(2), window, 0);
        assert_eq!(helper.deadline(), 1_000_000_000);
        helper.set_root_sent_to(2);
        helper.record(
            400,
            BroadcastReceipt {
                receiver: SimId(1),
                address: RingAddress::new(2),
                sent_to: 0,
                hops: 1,
            },
        );
        assert_eq!(helper.deadline(), 1_000_000_400);

        let stats = helper.finish();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.max_hops, 1);
        assert!((stats.average_hops - 0.5).abs() < 1e-9);
        assert!((stats.stddev_hops - 0.5f64.sqrt()).abs() < 1e-9);
        assert!((stats.average_sent_to - 1.0).abs() < 1e-9);
        assert!((stats.stddev_sent_to - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn results_file_lists_responders() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bcast.txt");
        let mut helper = BroadcastHelper::new(SimId(0), None, Duration::from_secs(1), 0);
        for (id, hops) in [(3, 1), (5, 2)] {
            helper.record(
                10,
                BroadcastReceipt {
                    receiver: SimId(id),
                    address: RingAddress::new(id as u128),
                    sent_to: 0,
                    hops,
                },
            );
        }
        helper.write_results(&path)?;
        helper.write_results(&path)?;
        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content, "3, 1\n5, 2\n3, 1\n5, 2\n");
        Ok(())
    }
}
