//! All-pairs ping latency measurement.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use futures::channel::mpsc;

use crate::{
    errors::RpcError,
    node::rpc::{self, RpcChannel, RpcResult, RpcValue},
};

#[derive(Debug, Clone, PartialEq)]
pub struct AllToAllReport {
    pub issued: usize,
    pub nodes: usize,
    /// Calls that came back with the expected echo.
    pub contributing: usize,
    pub average_latency: Duration,
    pub elapsed: Duration,
}

impl fmt::Display for AllToAllReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "All to all: {} tests, {} nodes, average latency {:?}, took {:?}",
            self.issued, self.nodes, self.average_latency, self.elapsed
        )
    }
}

/// Collects the answers of one batch of pings issued at the same instant.
#[derive(Debug)]
pub struct AllToAllHelper {
    nodes: usize,
    started_at: u64,
    issued: usize,
    outstanding: AtomicUsize,
    done: AtomicBool,
    total_latency: u64,
    contributing: usize,
    calls: Vec<mpsc::UnboundedReceiver<RpcResult>>,
}

impl AllToAllHelper {
    pub fn new(nodes: usize, now: u64) -> Self {
        Self {
            nodes,
            started_at: now,
            issued: 0,
            outstanding: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            total_latency: 0,
            contributing: 0,
            calls: Vec::new(),
        }
    }

    /// Sends one ping through `dispatch`. A dispatch failure is not counted as
    /// outstanding.
    pub fn issue<F>(&mut self, dispatch: F) -> Result<(), RpcError>
    where
        F: FnOnce(RpcChannel) -> Result<(), RpcError>,
    {
        let (tx, rx) = rpc::channel();
        dispatch(tx)?;
        self.issued += 1;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.calls.push(rx);
        Ok(())
    }

    pub fn issued(&self) -> usize {
        self.issued
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Collects whatever answers arrived. Returns the report exactly once,
    /// when the last outstanding call completes.
    pub fn poll(&mut self, now: u64) -> Option<AllToAllReport> {
        let mut finished = false;
        let mut still_waiting = Vec::with_capacity(self.calls.len());
        for mut rx in std::mem::take(&mut self.calls) {
            let completed = match rx.try_next() {
                Ok(Some(RpcResult {
                    value: RpcValue::Int(0),
                    ..
                })) => {
                    self.total_latency += now.saturating_sub(self.started_at);
                    self.contributing += 1;
                    true
                }
                // wrong echo or closed without a value
                Ok(_) => true,
                Err(_) => false,
            };
            if completed {
                finished |= self.complete_one();
            } else {
                still_waiting.push(rx);
            }
        }
        self.calls = still_waiting;
        if !finished && self.issued == 0 {
            finished = !self.done.swap(true, Ordering::SeqCst);
        }
        finished.then(|| self.report(now))
    }

    fn complete_one(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 && !self.done.swap(true, Ordering::SeqCst)
    }

    fn report(&self, now: u64) -> AllToAllReport {
        let average_latency = if self.contributing == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_latency / self.contributing as u64)
        };
        let report = AllToAllReport {
            issued: self.issued,
            nodes: self.nodes,
            contributing: self.contributing,
            average_latency,
            elapsed: Duration::from_nanos(now.saturating_sub(self.started_at)),
        };
        tracing::info!(
            issued = report.issued,
            nodes = report.nodes,
            average = ?report.average_latency,
            "All to all finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_fires_once_after_the_last_answer() -> testresult::TestResult {
        let mut helper = AllToAllHelper::new(3, 100);
        let mut senders = Vec::new();
        for _ in 0..3 {
            helper.issue(|tx| {
                senders.push(tx);
                Ok(())
            })?;
        }
        assert!(helper
            .issue(|_| Err(RpcError::NoRoute(crate::ring::RingAddress::new(0))))
            .is_err());
        assert_eq!(helper.issued(), 3);
        assert!(helper.poll(100).is_none());

        let responder = crate::ring::RingAddress::new(2);
        senders[0].unbounded_send(RpcResult {
            value: RpcValue::Int(0),
            responder,
        })?;
        senders[1].unbounded_send(RpcResult {
            value: RpcValue::Int(7),
            responder,
        })?;
        assert!(helper.poll(300).is_none());
        assert_eq!(helper.outstanding(), 1);

        senders.pop();
        let report = helper.poll(500).ok_or("no report")?;
        assert_eq!(report.issued, 3);
        assert_eq!(report.contributing, 1);
        assert_eq!(report.average_latency, Duration::from_nanos(200));
        assert_eq!(report.elapsed, Duration::from_nanos(400));
        assert!(helper.poll(600).is_none());
        Ok(())
    }
}
