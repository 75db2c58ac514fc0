//! Ring identifiers and per-node connection bookkeeping.

mod address;
mod connection;

pub use address::{AddressParseError, Distance, RingAddress};
pub use connection::{Connection, ConnectionKind, ConnectionTable, PeerInfo};
