use crate::{ring::RingAddress, transport::SimId};

/// Failures surfaced by the simulation driver and its coordinators.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("simulation id {0} is already registered")]
    DuplicateId(SimId),
    #[error("address {0} is already registered")]
    DuplicateAddress(RingAddress),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("failed to generate a free address after {attempts} attempts")]
    AddressSpaceExhausted { attempts: usize },
    #[error("no node at index {0}")]
    NoSuchIndex(usize),
    #[error("operation needs at least {needed} nodes, found {found}")]
    NotEnoughNodes { needed: usize, found: usize },
    #[error("security is not enabled for this simulation")]
    SecurityDisabled,
    #[error("cryptographic failure: {0}")]
    Crypto(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rsa::Error> for SimulationError {
    fn from(err: rsa::Error) -> Self {
        SimulationError::Crypto(err.to_string())
    }
}

impl From<bincode::Error> for SimulationError {
    fn from(err: bincode::Error) -> Self {
        SimulationError::Crypto(format!("encoding: {err}"))
    }
}

/// Reasons an RPC call could not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("no route towards {0}")]
    NoRoute(RingAddress),
    #[error("call timed out")]
    Timeout,
    #[error("caller is not authorized")]
    Unauthorized,
    #[error("node is closed")]
    Closed,
}
