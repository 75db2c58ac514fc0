//! Discrete-event simulation of a structured ring overlay.
//!
//! Every node of the overlay lives in one process and talks to the others
//! through simulated transports driven by a single event queue. The
//! [`Simulator`] grows the network, waits for the ring to converge and runs
//! measurements over it: broadcasts, ring crawls, all-to-all latency and a
//! small replicated key/value store.

/// Node construction: listener stacks, certificates and seed peers.
pub mod bootstrap;

/// Simulation configuration, from the command line and config files.
pub mod config;

pub mod errors;

/// Overlay node state machine, routing and remote calls.
pub mod node;

/// Measurement coordinators and the ring verifier.
pub mod protocols;

/// Live node bookkeeping and address allocation.
pub mod registry;

/// Ring address space and connection tables.
pub mod ring;

/// Certificate authority, per-node handlers and edge handshakes.
pub mod security;

/// Deterministic scheduler, virtual time and seeded randomness.
pub mod simulation;

mod simulator;
pub use simulator::{ConnectionStateReport, Revocation, Simulator};

pub mod stats;

/// Tracing and logging infrastructure.
#[cfg_attr(test, allow(dead_code))]
pub mod tracing;

/// Simulated transport addresses, listeners and link latency.
pub mod transport;

pub use config::{SimulationArgs, SimulationConfig};
pub use errors::{RpcError, SimulationError};
pub use node::ConnectionState;
pub use ring::RingAddress;
pub use transport::SimId;
