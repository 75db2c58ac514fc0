//! Rings built with the optional stack layers: certificates, security
//! associations, path multiplexing, broken links and network coordinates.

use std::time::Duration;

use ringsim::{security::subject_name, SimulationConfig, SimulationError, Simulator};
use testresult::TestResult;

fn secure(size: usize, seed: u64) -> SimulationConfig {
    SimulationConfig {
        evaluation: true,
        secure_edges: true,
        secure_senders: true,
        authority_key_bits: 1024,
        ..SimulationConfig::new(size, seed)
    }
}

#[test_log::test]
fn secure_edges_form_a_ring() -> TestResult {
    let mut sim = Simulator::new(secure(8, 3))?;
    assert!(sim.complete(true));
    for record in sim.registry().iter() {
        assert!(record.node.listener().is_secure());
        let cert = record.node.security().ok_or("no security")?.handler().local_certificate();
        assert_eq!(cert.subject(), subject_name(&record.address));
    }
    Ok(())
}

#[test_log::test]
fn secure_senders_crawl_and_ping() -> TestResult {
    for dtls in [false, true] {
        let mut sim = Simulator::new(SimulationConfig {
            dtls,
            ..secure(6, 12)
        })?;
        assert!(sim.complete(true));

        let report = sim.crawl(true)?;
        assert!(report.success, "secure crawl failed (dtls: {dtls})");
        assert_eq!(report.consistency, 6);

        let report = sim.all_to_all(true)?;
        assert_eq!(report.issued, 30);
        assert_eq!(report.contributing, 30);
    }
    Ok(())
}

#[test_log::test]
fn revocation_cuts_the_victim_off() -> TestResult {
    let mut sim = Simulator::new(secure(16, 77))?;
    assert!(sim.complete(true));

    let revocation = sim.revoke()?;
    assert_ne!(revocation.victim, revocation.revoker);
    assert_eq!(revocation.subject, subject_name(&revocation.victim_address));
    let trust = sim.trust().ok_or("no authority")?;
    assert!(trust.issued_revocations().contains(&revocation.subject));

    sim.run_for(Duration::from_secs(10));
    let mut reached = 0;
    for record in sim.registry().iter().filter(|r| r.id != revocation.victim) {
        let handler = record.node.security().ok_or("no security")?.handler();
        assert!(
            handler.is_revoked(&revocation.subject),
            "{} never learned of the revocation",
            record.id
        );
        assert!(
            !record.node.connections().contains(&revocation.victim_address),
            "{} still linked to the revoked node",
            record.id
        );
        reached += 1;
    }
    assert_eq!(reached, 15);
    Ok(())
}

#[test_log::test]
fn revocation_needs_an_authority() -> TestResult {
    let mut sim = Simulator::new(SimulationConfig::new(4, 1))?;
    assert!(matches!(sim.revoke(), Err(SimulationError::SecurityDisabled)));
    Ok(())
}

#[test_log::test]
fn pathing_multiplexes_endpoints() -> TestResult {
    let mut sim = Simulator::new(SimulationConfig {
        evaluation: true,
        pathing: true,
        ..SimulationConfig::new(8, 19)
    })?;
    assert!(sim.complete(true));
    for record in sim.registry().iter() {
        let transport = record.node.transport();
        assert_eq!(transport.path(), Some("p0"));
        let pm = record.node.path_manager().ok_or("no path manager")?;
        assert!(pm.edges("p0") > 0);
    }
    Ok(())
}

#[test_log::test]
fn broken_links_are_relayed() -> TestResult {
    let mut sim = Simulator::new(SimulationConfig {
        evaluation: true,
        broken: 0.1,
        ..SimulationConfig::new(8, 29)
    })?;
    assert!(sim.complete(true));
    for record in sim.registry().iter() {
        assert!(record.node.relay_listener().is_some_and(|l| l.is_relay()));
    }
    Ok(())
}

#[test_log::test]
fn coordinates_learn_neighbor_latency() -> TestResult {
    let mut sim = Simulator::new(SimulationConfig {
        evaluation: true,
        nc_enable: true,
        ..SimulationConfig::new(6, 37)
    })?;
    assert!(sim.complete(true));
    sim.run_for(Duration::from_secs(20));
    let record = sim.node_at(0)?;
    let right = record.node.right_neighbor().ok_or("no right neighbor")?.address();
    let nc = record.node.coordinates().ok_or("no coordinates")?;
    assert!(nc.sample_count() > 0);
    assert!(nc.estimate(&right).is_some());
    Ok(())
}

#[test_log::test]
fn latency_map_drives_link_delay() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("latency.json");
    let n = 4;
    let matrix: Vec<Vec<u32>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 0 } else { 25 }).collect())
        .collect();
    std::fs::write(&path, serde_json::to_string(&matrix)?)?;

    let mut sim = Simulator::new(SimulationConfig {
        evaluation: true,
        latency_map: Some(path),
        ..SimulationConfig::new(n, 5)
    })?;
    assert!(sim.complete(true));
    let report = sim.all_to_all(false)?;
    assert_eq!(report.contributing, 12);
    // one way out and one back, at least
    assert!(report.average_latency >= Duration::from_millis(50));
    Ok(())
}
