//! Simulated transport.
//!
//! Endpoints are addressed by `s.sim://<id>` URIs. Delivery itself happens in
//! the simulator, which delays every message by the latency between the two
//! ids; this module holds the per-node pieces: listener stacks, link
//! authorization and the latency table.

mod address;
mod authorizer;
mod latency;
pub mod listener;

pub use address::{SimId, TransportAddress, TransportAddressError};
pub use authorizer::{Authorizer, BrokenAuthorizer, Decision};
pub use latency::LatencyMap;
pub use listener::{Listener, RelayOverlap, StackContext, StackStep};
