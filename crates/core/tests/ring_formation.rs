//! Ring formation, churn and the local ring check.

use std::time::Duration;

use ringsim::{ConnectionState, SimulationConfig, SimulationError, Simulator};
use testresult::TestResult;

fn evaluation(size: usize, seed: u64) -> SimulationConfig {
    SimulationConfig {
        evaluation: true,
        ..SimulationConfig::new(size, seed)
    }
}

#[test_log::test]
fn evaluation_ring_forms_at_several_sizes() -> TestResult {
    for size in [4, 8, 16, 32] {
        let mut sim = Simulator::new(evaluation(size, 0xBEEF + size as u64))?;
        assert!(sim.complete(true), "ring of {size} did not form");
        assert!(sim.find_missing().is_empty());
        assert_eq!(sim.registry().len(), size);
        assert_eq!(sim.connection_state_report().connected, size);
    }
    Ok(())
}

#[test_log::test]
fn random_seeded_ring_forms() -> TestResult {
    let mut sim = Simulator::new(SimulationConfig::new(16, 7))?;
    assert!(sim.complete(false));
    for record in sim.registry().iter() {
        assert_eq!(record.node.state(), ConnectionState::Connected);
    }
    Ok(())
}

#[test_log::test]
fn single_node_is_a_ring() -> TestResult {
    let mut sim = Simulator::new(SimulationConfig::new(1, 3))?;
    assert!(sim.check_ring());
    assert!(sim.complete(true));
    Ok(())
}

#[test_log::test]
fn check_ring_does_not_change_state() -> TestResult {
    let mut sim = Simulator::new(evaluation(8, 21))?;
    let before = sim.check_ring();
    let now = sim.now();
    assert_eq!(sim.check_ring(), before);
    assert_eq!(sim.now(), now);
    assert!(sim.complete(true));
    assert!(sim.check_ring());
    assert!(sim.check_ring());
    Ok(())
}

#[test_log::test]
fn ring_heals_after_removals() -> TestResult {
    let mut sim = Simulator::new(evaluation(12, 5))?;
    assert!(sim.complete(true));

    let clean = sim.node_at(3)?.address;
    sim.remove_node(&clean, true)?;
    assert_eq!(sim.registry().len(), 11);
    assert!(!sim.registry().contains_address(&clean));
    assert!(sim.complete(true), "ring did not heal after a clean removal");

    sim.remove_random_node(false)?;
    assert_eq!(sim.registry().len(), 10);
    assert!(!sim.check_ring());
    assert!(sim.complete(true), "ring did not heal after a crash");
    Ok(())
}

#[test_log::test]
fn joining_node_is_absorbed() -> TestResult {
    let mut sim = Simulator::new(evaluation(8, 13))?;
    assert!(sim.complete(true));
    let id = sim.add_node()?;
    assert_eq!(sim.registry().len(), 9);
    assert!(sim.complete(true));
    assert!(sim.node(id).is_some_and(|n| n.is_connected()));
    Ok(())
}

#[test_log::test]
fn removing_unknown_node_fails() -> TestResult {
    let mut sim = Simulator::new(evaluation(4, 1))?;
    let address = sim.node_at(0)?.address;
    sim.remove_node(&address, true)?;
    assert!(matches!(
        sim.remove_node(&address, true),
        Err(SimulationError::UnknownNode(_))
    ));
    Ok(())
}

#[test_log::test]
fn disconnect_empties_the_network() -> TestResult {
    let mut sim = Simulator::new(evaluation(6, 8))?;
    assert!(sim.complete(true));
    sim.disconnect();
    assert!(sim.registry().is_empty());
    sim.run_for(Duration::from_secs(5));
    assert!(!sim.run_step());
    Ok(())
}

#[test_log::test]
fn same_seed_same_ring() -> TestResult {
    let run = || -> Result<(Vec<String>, u64), SimulationError> {
        let mut sim = Simulator::new(SimulationConfig::new(10, 99))?;
        sim.complete(true);
        let addresses = sim.registry().addresses().map(|a| a.to_string()).collect();
        Ok((addresses, sim.now()))
    };
    assert_eq!(run()?, run()?);
    Ok(())
}
