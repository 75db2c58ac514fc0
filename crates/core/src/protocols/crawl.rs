//! Ring crawl over remote calls.
//!
//! Unlike the local ring check, the crawl asks each node for its own view of
//! its neighbors (`sys:link.GetNeighbors`) and walks right until it sees an
//! address twice. Agreement between consecutive answers is counted as it goes.

use std::{collections::BTreeSet, fmt, time::Duration};

use futures::channel::mpsc;

use crate::{
    errors::RpcError,
    node::rpc::{self, RpcChannel, RpcResult, RpcValue, Sender},
    ring::RingAddress,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    pub visited: usize,
    pub expected: usize,
    pub consistency: usize,
    pub success: bool,
    pub elapsed: Duration,
}

impl CrawlReport {
    /// Agreement over the nodes actually crawled.
    pub fn consistency_ratio(&self) -> f64 {
        if self.visited == 0 {
            return 0.0;
        }
        self.consistency as f64 / self.visited as f64
    }
}

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Crawl stats: {}/{}", self.visited, self.expected)?;
        write!(
            f,
            "Consistency: {}/{} ({:.3})",
            self.consistency,
            self.visited,
            self.consistency_ratio()
        )
    }
}

#[derive(Debug)]
pub struct CrawlHelper {
    origin: RingAddress,
    secure: bool,
    expected: usize,
    current: RingAddress,
    visited: BTreeSet<RingAddress>,
    consistency: usize,
    previous: Option<RingAddress>,
    first_left: Option<RingAddress>,
    pending: Option<mpsc::UnboundedReceiver<RpcResult>>,
    started_at: u64,
    report: Option<CrawlReport>,
}

impl CrawlHelper {
    pub fn new(origin: RingAddress, expected: usize, secure: bool, now: u64) -> Self {
        Self {
            origin,
            secure,
            expected,
            current: origin,
            visited: BTreeSet::new(),
            consistency: 0,
            previous: None,
            first_left: None,
            pending: None,
            started_at: now,
            report: None,
        }
    }

    pub fn origin(&self) -> RingAddress {
        self.origin
    }

    pub fn report(&self) -> Option<&CrawlReport> {
        self.report.as_ref()
    }

    /// Advances the crawl as far as it can without waiting on the network.
    /// `issue` sends one call from the origin node.
    pub fn poll<F>(&mut self, now: u64, mut issue: F) -> Option<&CrawlReport>
    where
        F: FnMut(Sender, RpcChannel) -> Result<(), RpcError>,
    {
        while self.report.is_none() {
            match self.pending.as_mut() {
                None => {
                    if self.visited.contains(&self.current) {
                        let success = self.visited.len() == self.expected;
                        self.finish(now, success);
                        break;
                    }
                    let (tx, rx) = rpc::channel();
                    let sender = if self.secure {
                        Sender::Secure(self.current)
                    } else {
                        Sender::Greedy(self.current)
                    };
                    // keyed on the address asked, whoever answers for it
                    self.visited.insert(self.current);
                    if let Err(err) = issue(sender, tx) {
                        tracing::debug!(target = %self.current, %err, "Crawl call not sent");
                        self.finish(now, false);
                        break;
                    }
                    self.pending = Some(rx);
                }
                Some(rx) => match rx.try_next() {
                    Ok(Some(result)) => {
                        self.pending = None;
                        if !self.on_reply(result.value) {
                            self.finish(now, false);
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(target = %self.current, "Crawl call failed");
                        self.pending = None;
                        self.finish(now, false);
                    }
                    Err(_) => break,
                },
            }
        }
        self.report.as_ref()
    }

    /// Gives up on a crawl that can no longer make progress.
    pub fn abandon(&mut self, now: u64) -> CrawlReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        self.pending = None;
        self.finish(now, false).clone()
    }

    fn on_reply(&mut self, value: RpcValue) -> bool {
        let RpcValue::Neighbors { own, left, right } = value else {
            return false;
        };
        match self.previous {
            None => self.first_left = left,
            Some(previous) if left == Some(previous) => self.consistency += 1,
            Some(_) => {}
        }
        if self.first_left == Some(own) && right == Some(self.origin) {
            self.consistency += 1;
        }
        self.previous = Some(own);
        match right {
            Some(next) => {
                self.current = next;
                true
            }
            None => false,
        }
    }

    fn finish(&mut self, now: u64, success: bool) -> &CrawlReport {
        let report = CrawlReport {
            visited: self.visited.len(),
            expected: self.expected,
            consistency: self.consistency,
            success,
            elapsed: Duration::from_nanos(now.saturating_sub(self.started_at)),
        };
        tracing::info!(
            visited = report.visited,
            expected = report.expected,
            consistency = report.consistency,
            success,
            "Crawl finished"
        );
        self.report.insert(report)
    }
}
