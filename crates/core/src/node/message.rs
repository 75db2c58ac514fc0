//! Messages exchanged between overlay nodes.

use std::time::Duration;

use super::{
    coordinates::Coordinates,
    rpc::{CallId, RpcRequest, RpcValue},
};
use crate::{
    errors::RpcError,
    ring::{ConnectionKind, PeerInfo, RingAddress},
    security::{Certificate, RevocationNotice},
    transport::{SimId, TransportAddress},
};

#[derive(Debug, Clone)]
pub(crate) enum Message {
    LinkRequest {
        from: PeerInfo,
        kind: ConnectionKind,
        certificate: Option<Certificate>,
        relayed_by: Option<SimId>,
    },
    LinkReply {
        from: PeerInfo,
        kind: ConnectionKind,
        accepted: bool,
        certificate: Option<Certificate>,
        relayed_by: Option<SimId>,
    },
    /// Asks the receiver to forward a link request to `target` on our behalf.
    RelayLink {
        requester: PeerInfo,
        target: TransportAddress,
        kind: ConnectionKind,
        certificate: Option<Certificate>,
    },
    RelayFailed {
        target: TransportAddress,
    },
    Close {
        from: RingAddress,
    },
    /// Near-neighborhood gossip used for ring stabilization.
    Announce {
        from: PeerInfo,
        peers: Vec<PeerInfo>,
    },
    CoordinateProbe {
        from: RingAddress,
        sent_at: u64,
        coordinates: Coordinates,
    },
    CoordinateReply {
        from: RingAddress,
        sent_at: u64,
        coordinates: Coordinates,
    },
    Routed(Routed),
    Broadcast(BroadcastMessage),
}

/// A message forwarded greedily towards a ring address.
#[derive(Debug, Clone)]
pub(crate) struct Routed {
    pub source: PeerInfo,
    pub dest: RingAddress,
    /// Drop instead of delivering at the closest node when `dest` is absent.
    pub exact: bool,
    pub hops: u32,
    pub payload: RoutedPayload,
}

#[derive(Debug, Clone)]
pub(crate) enum RoutedPayload {
    /// Asks whichever node is closest to `dest` to link back to the source.
    ConnectToMe { kind: ConnectionKind },
    Request {
        call: CallId,
        request: RpcRequest,
        secure: bool,
    },
    Response {
        call: CallId,
        result: Result<RpcValue, RpcError>,
    },
    Handshake {
        stage: u8,
        certificate: Certificate,
    },
}

impl RoutedPayload {
    pub fn is_connect_to_me(&self) -> bool {
        matches!(self, RoutedPayload::ConnectToMe { .. })
    }
}

/// Broadcast covering the clockwise arc `[from, to]`.
#[derive(Debug, Clone)]
pub(crate) struct BroadcastMessage {
    pub source: RingAddress,
    pub from: RingAddress,
    pub to: RingAddress,
    pub forwarders: Option<usize>,
    pub hops: u32,
    pub payload: BroadcastPayload,
}

#[derive(Debug, Clone)]
pub(crate) enum BroadcastPayload {
    /// Measurement broadcast; every receiver reports back to the collector.
    Probe,
    Revocation(RevocationNotice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeTimer {
    Stabilize,
    LinkTimeout(SimId),
    RpcTimeout(CallId),
    HandshakeTimeout(RingAddress),
    ProxyRefresh(u64),
}

#[derive(Debug, Clone)]
pub(crate) enum NodeInput {
    Message {
        from: SimId,
        via: Option<SimId>,
        message: Message,
    },
    Timer(NodeTimer),
    /// A message we sent to `remote` could not be delivered.
    EdgeFailure { remote: SimId },
}

#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub to: SimId,
    pub via: Option<SimId>,
    pub message: Message,
}

/// Things a node reports to the driver rather than to other nodes.
#[derive(Debug, Clone)]
pub(crate) enum Notice {
    BroadcastReceived(crate::protocols::broadcast::BroadcastReceipt),
}

/// Side effects produced while a node handles one input.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub outgoing: Vec<Outgoing>,
    pub timers: Vec<(Duration, NodeTimer)>,
    pub notices: Vec<Notice>,
}
