//! Broadcast, crawl, all-to-all and key/value runs over a formed ring.

use std::time::Duration;

use ringsim::{
    node::rpc::{RpcRequest, RpcValue, Sender},
    stats, SimulationConfig, SimulationError, Simulator,
};
use testresult::TestResult;

fn formed(size: usize, seed: u64) -> Result<Simulator, SimulationError> {
    let mut sim = Simulator::new(SimulationConfig {
        evaluation: true,
        ..SimulationConfig::new(size, seed)
    })?;
    assert!(sim.complete(true), "ring of {size} did not form");
    Ok(sim)
}

#[test_log::test]
fn bounded_broadcast_reaches_everyone() -> TestResult {
    let result = tempfile::NamedTempFile::new()?;
    let mut sim = Simulator::new(SimulationConfig {
        evaluation: true,
        output: Some(result.path().to_path_buf()),
        ..SimulationConfig::new(16, 42)
    })?;
    assert!(sim.complete(true));

    let stats = sim.broadcast_from(0, Some(3))?;
    assert_eq!(stats.hits, 15);
    assert!(stats.max_hops >= 1);
    assert!(stats.root_sent_to <= 3);
    assert!(stats.receipts.iter().all(|r| r.sent_to <= 3));
    assert!(stats.receipts.iter().all(|r| r.hops >= 1));

    // the root counts as a zero-hop record
    let hops: Vec<f64> = stats
        .receipts
        .iter()
        .map(|r| f64::from(r.hops))
        .chain(std::iter::once(0.0))
        .collect();
    assert_eq!(hops.len(), 16);
    let mean = stats::average(&hops);
    assert!((mean - stats.average_hops).abs() < 1e-9);
    assert!((stats::standard_deviation(&hops, mean) - stats.stddev_hops).abs() < 1e-9);
    let max = stats.receipts.iter().map(|r| r.hops).max().unwrap_or(0);
    assert_eq!(max, stats.max_hops);
    assert!(stats.average_hops > 1.0);

    let lines = std::fs::read_to_string(result.path())?;
    assert_eq!(lines.lines().count(), 15);

    // results are appended per round
    let again = sim.broadcast_from(0, Some(3))?;
    assert_eq!(again.hits, 15);
    assert_eq!(std::fs::read_to_string(result.path())?.lines().count(), 30);
    Ok(())
}

#[test_log::test]
fn unbounded_broadcast_from_random_root() -> TestResult {
    let mut sim = formed(10, 4)?;
    let stats = sim.broadcast(None)?;
    assert_eq!(stats.hits, 9);
    assert!(stats.receipts.iter().all(|r| r.receiver != stats.root));
    Ok(())
}

#[test_log::test]
fn crawl_sees_a_consistent_ring() -> TestResult {
    let mut sim = formed(8, 17)?;
    let report = sim.crawl(false)?;
    assert!(report.success);
    assert_eq!(report.visited, 8);
    assert_eq!(report.consistency, 8);
    assert!((report.consistency_ratio() - 1.0).abs() < f64::EPSILON);
    Ok(())
}

#[test_log::test]
fn secure_crawl_needs_security() -> TestResult {
    let mut sim = formed(4, 2)?;
    assert!(matches!(
        sim.crawl(true),
        Err(SimulationError::SecurityDisabled)
    ));
    Ok(())
}

#[test_log::test]
fn all_to_all_pings_every_pair() -> TestResult {
    let mut sim = formed(5, 23)?;
    let report = sim.all_to_all(false)?;
    assert_eq!(report.issued, 20);
    assert_eq!(report.nodes, 5);
    assert_eq!(report.contributing, 20);
    assert!(report.average_latency > Duration::ZERO);
    assert!(report.average_latency <= report.elapsed);
    Ok(())
}

#[test_log::test]
fn ping_echoes_its_argument() -> TestResult {
    let mut sim = formed(6, 31)?;
    let from = sim.node_at(0)?.id;
    let target = sim.node_at(3)?.address;
    let mut rx = sim.invoke(from, Sender::Greedy(target), RpcRequest::Ping(7))?;
    let result = sim.block_on(Box::pin(futures::StreamExt::next(&mut rx)));
    let result = result.flatten().ok_or("no answer")?;
    assert_eq!(result.value, RpcValue::Int(7));
    assert_eq!(result.responder, target);
    Ok(())
}

#[test_log::test]
fn values_survive_put_and_get() -> TestResult {
    let mut sim = formed(12, 55)?;
    let writer = sim.node_at(2)?.id;
    let reader = sim.node_at(9)?.id;

    let put = sim.put(writer, b"colour", b"blue", Duration::from_secs(600))?;
    assert_eq!(sim.block_on(put), Some(true));

    let get = sim.get(reader, b"colour")?;
    let values = sim.block_on(get).ok_or("get did not finish")?;
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value, b"blue".to_vec());

    let get = sim.get(reader, b"missing")?;
    let values = sim.block_on(get).ok_or("get did not finish")?;
    assert!(values.is_empty());
    Ok(())
}
