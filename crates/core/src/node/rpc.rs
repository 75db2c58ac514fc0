//! Request/response calls carried over greedy routing.
//!
//! A caller hands [`OverlayNode::invoke`](super::OverlayNode) a sender and a
//! response channel. The channel receives zero or more [`RpcResult`]s and is
//! then closed; a close without a value means the call failed.

use std::{collections::BTreeMap, fmt, time::Duration};

use futures::channel::mpsc;
use serde::{Deserialize, Serialize};

use super::dht::DhtValue;
use crate::ring::RingAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub(crate) u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// How a call reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// Best effort: delivered at whichever node is closest to the address.
    Greedy(RingAddress),
    /// Exact delivery over an established security association.
    Secure(RingAddress),
}

impl Sender {
    pub fn destination(&self) -> RingAddress {
        match self {
            Sender::Greedy(addr) | Sender::Secure(addr) => *addr,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Sender::Secure(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Ping(i32),
    GetNeighbors,
    DhtPut {
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    },
    DhtGet {
        key: Vec<u8>,
    },
    ProxyRegister {
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    },
    ProxyUnregister {
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl RpcRequest {
    /// Registered name of the remote method.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Ping(_) => "sys:link.Ping",
            RpcRequest::GetNeighbors => "sys:link.GetNeighbors",
            RpcRequest::DhtPut { .. } => "dht.Put",
            RpcRequest::DhtGet { .. } => "dht.Get",
            RpcRequest::ProxyRegister { .. } => "RpcDhtProxy.Register",
            RpcRequest::ProxyUnregister { .. } => "RpcDhtProxy.Unregister",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcValue {
    Int(i32),
    Bool(bool),
    Neighbors {
        own: RingAddress,
        left: Option<RingAddress>,
        right: Option<RingAddress>,
    },
    Values(Vec<DhtValue>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub value: RpcValue,
    pub responder: RingAddress,
}

pub type RpcChannel = mpsc::UnboundedSender<RpcResult>;

/// Opens a response channel for [`OverlayNode::invoke`](super::OverlayNode).
pub fn channel() -> (RpcChannel, mpsc::UnboundedReceiver<RpcResult>) {
    mpsc::unbounded()
}

/// Where the outcome of a call goes.
#[derive(Debug)]
pub(crate) enum ResponseSink {
    Channel(RpcChannel),
    Dht { op: u64 },
}

#[derive(Debug)]
pub(crate) struct PendingCall {
    pub sink: ResponseSink,
    pub dest: RingAddress,
    pub request: RpcRequest,
    pub secure: bool,
    pub issued_at: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RpcState {
    next_call: u64,
    pending: BTreeMap<CallId, PendingCall>,
}

impl RpcState {
    pub fn register(&mut self, call: PendingCall) -> CallId {
        let id = CallId(self.next_call);
        self.next_call += 1;
        self.pending.insert(id, call);
        id
    }

    pub fn get(&self, id: &CallId) -> Option<&PendingCall> {
        self.pending.get(id)
    }

    pub fn take(&mut self, id: &CallId) -> Option<PendingCall> {
        self.pending.remove(id)
    }

    pub fn drain(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
