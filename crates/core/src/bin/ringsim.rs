use anyhow::Context;
use clap::Parser;
use ringsim::{
    config::{set_logger, SimulationArgs},
    simulation::{RealTime, TimeSource},
    Simulator,
};

fn main() -> anyhow::Result<()> {
    let args = SimulationArgs::parse();
    set_logger(args.log_level);
    let wall = RealTime::new();

    let config = args.build()?;
    tracing::info!(
        size = config.size,
        seed = config.seed,
        secure = config.is_secure(),
        pathing = config.pathing,
        broken = config.broken,
        "Simulation configured"
    );
    let mut sim = Simulator::new(config.clone()).context("starting the network")?;

    if !sim.complete(false) {
        println!("Ring did not form within {:?}", config.max_wait);
        for missing in sim.find_missing() {
            println!("Missing: {missing}");
        }
        println!("{}", sim.connection_state_report());
    }

    if let Some(fanout) = config.broadcast {
        let stats = sim.broadcast(fanout.limit())?;
        println!("{stats}");
    }
    if config.crawl {
        let report = sim.crawl(config.secure_senders)?;
        println!("{report}");
    }
    if config.all_to_all {
        match sim.all_to_all(config.secure_senders) {
            Ok(report) => println!("{report}"),
            Err(err) => println!("All-to-all did not finish: {err}"),
        }
    }

    sim.disconnect();
    println!(
        "Simulated {:?} in {:?} ({} events)",
        std::time::Duration::from_nanos(sim.now()),
        wall.now(),
        sim.processed_events()
    );
    Ok(())
}
