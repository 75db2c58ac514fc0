//! Overlay node.
//!
//! A node is a passive state machine: the simulator feeds it one input at a
//! time (a delivered message, a fired timer or a failed send) through
//! [`OverlayNode::handle`], and the node answers by pushing outgoing messages,
//! timers and driver notices into its [`NodeContext`].
//!
//! # Joining
//!
//! `connect` links to the node's remote transport addresses as leafs. Once the
//! first link is up the node routes a connect-to-me request towards its own
//! address; whichever node is closest links back as a near neighbor. From then
//! on periodic stabilization gossips each node's near neighborhood to its
//! connections, and every node links to the nearest peers it hears of on both
//! sides. A node whose left and right structured neighbors are both present is
//! connected, and then asks for one long-range shortcut.

pub mod coordinates;
pub mod dht;
pub(crate) mod message;
pub mod path;
pub mod rpc;
mod routing;

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use futures::channel::{mpsc, oneshot};
use itertools::Itertools;
use serde::Serialize;

use self::{
    coordinates::NcService,
    dht::{replica_addresses, DhtClient, DhtOp, DhtProxy, DhtValue, TableServer},
    message::{
        BroadcastMessage, BroadcastPayload, Effects, Message, NodeInput, NodeTimer, Notice,
        Outgoing,
    },
    path::PathManager,
    rpc::{ResponseSink, RpcRequest, RpcState, Sender},
};
use crate::{
    errors::RpcError,
    protocols::broadcast::{BroadcastReceipt, BroadcastSender},
    ring::{Connection, ConnectionKind, ConnectionTable, PeerInfo, RingAddress},
    security::{subject_name, Certificate, RevocationNotice, SecurityOverlord},
    simulation::SimulationRng,
    transport::{Decision, Listener, RelayOverlap, SimId, TransportAddress},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Offline,
    Joining,
    Connected,
    Leaving,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct NodeParams {
    pub stabilize_interval: Duration,
    pub rpc_timeout: Duration,
    pub link_timeout: Duration,
    /// Near neighbors kept on each side of the node.
    pub near_per_side: usize,
    pub dht_degree: u32,
}

impl Default for NodeParams {
    fn default() -> Self {
        Self {
            stabilize_interval: Duration::from_millis(crate::config::DEFAULT_STABILIZE_MS),
            rpc_timeout: Duration::from_millis(crate::config::DEFAULT_RPC_TIMEOUT_MS),
            link_timeout: Duration::from_millis(crate::config::DEFAULT_RPC_TIMEOUT_MS),
            near_per_side: 2,
            dht_degree: crate::config::DEFAULT_DHT_DEGREE,
        }
    }
}

/// Handle through which a node emits side effects while handling an input.
pub(crate) struct NodeContext<'a> {
    pub now: u64,
    pub rng: &'a SimulationRng,
    effects: &'a mut Effects,
}

impl<'a> NodeContext<'a> {
    pub fn new(now: u64, rng: &'a SimulationRng, effects: &'a mut Effects) -> Self {
        Self { now, rng, effects }
    }

    pub fn send(&mut self, to: SimId, via: Option<SimId>, message: Message) {
        self.effects.outgoing.push(Outgoing { to, via, message });
    }

    pub fn schedule(&mut self, after: Duration, timer: NodeTimer) {
        self.effects.timers.push((after, timer));
    }

    pub fn notify(&mut self, notice: Notice) {
        self.effects.notices.push(notice);
    }
}

#[derive(Debug)]
struct PendingLink {
    kind: ConnectionKind,
    target: TransportAddress,
    relayed: bool,
    started_at: u64,
}

pub struct OverlayNode {
    sim_id: SimId,
    address: RingAddress,
    state: ConnectionState,
    params: NodeParams,
    listener: Listener,
    relay_listener: Option<Listener>,
    table: ConnectionTable,
    known: BTreeMap<RingAddress, PeerInfo>,
    departed: BTreeSet<RingAddress>,
    pending_links: BTreeMap<SimId, PendingLink>,
    relay_attempts: BTreeMap<SimId, usize>,
    remote_tas: Vec<TransportAddress>,
    security: Option<SecurityOverlord>,
    rpc: RpcState,
    table_server: TableServer,
    dht: DhtClient,
    proxy: DhtProxy,
    coordinates: Option<NcService>,
    path_manager: Option<PathManager>,
    stabilizing: bool,
    join_requested: bool,
    shortcut_requested: bool,
}

impl OverlayNode {
    pub fn new(sim_id: SimId, address: RingAddress, params: NodeParams, listener: Listener) -> Self {
        let dht = DhtClient::new(params.dht_degree);
        Self {
            sim_id,
            address,
            state: ConnectionState::Offline,
            params,
            listener,
            relay_listener: None,
            table: ConnectionTable::new(),
            known: BTreeMap::new(),
            departed: BTreeSet::new(),
            pending_links: BTreeMap::new(),
            relay_attempts: BTreeMap::new(),
            remote_tas: Vec::new(),
            security: None,
            rpc: RpcState::default(),
            table_server: TableServer::default(),
            dht,
            proxy: DhtProxy::default(),
            coordinates: None,
            path_manager: None,
            stabilizing: false,
            join_requested: false,
            shortcut_requested: false,
        }
    }

    pub fn with_relay_listener(mut self, listener: Listener) -> Self {
        self.relay_listener = Some(listener);
        self
    }

    pub fn with_security(mut self, overlord: SecurityOverlord) -> Self {
        self.security = Some(overlord);
        self
    }

    pub fn with_coordinates(mut self, nc: NcService) -> Self {
        self.coordinates = Some(nc);
        self
    }

    pub fn with_path_manager(mut self, pm: PathManager) -> Self {
        self.path_manager = Some(pm);
        self
    }

    pub fn sim_id(&self) -> SimId {
        self.sim_id
    }

    pub fn address(&self) -> RingAddress {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Joining | ConnectionState::Connected
        )
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn relay_listener(&self) -> Option<&Listener> {
        self.relay_listener.as_ref()
    }

    pub fn remote_tas(&self) -> &[TransportAddress] {
        &self.remote_tas
    }

    pub fn set_remote_tas(&mut self, tas: Vec<TransportAddress>) {
        self.remote_tas = tas;
    }

    pub fn security(&self) -> Option<&SecurityOverlord> {
        self.security.as_ref()
    }

    pub fn coordinates(&self) -> Option<&NcService> {
        self.coordinates.as_ref()
    }

    pub fn path_manager(&self) -> Option<&PathManager> {
        self.path_manager.as_ref()
    }

    pub fn table_server(&self) -> &TableServer {
        &self.table_server
    }

    pub fn pending_calls(&self) -> usize {
        self.rpc.len()
    }

    pub fn transport(&self) -> TransportAddress {
        self.listener
            .local_address()
            .unwrap_or_else(|| TransportAddress::new(self.sim_id))
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address,
            transport: self.transport(),
        }
    }

    /// Nearest structured neighbor counter-clockwise.
    pub fn left_neighbor(&self) -> Option<&Connection> {
        self.table.left_of(&self.address)
    }

    /// Nearest structured neighbor clockwise.
    pub fn right_neighbor(&self) -> Option<&Connection> {
        self.table.right_of(&self.address)
    }

    fn local_certificate(&self) -> Option<Certificate> {
        self.security
            .as_ref()
            .map(|s| s.handler().local_certificate().clone())
    }

    fn is_revoked(&self, address: &RingAddress) -> bool {
        self.security
            .as_ref()
            .is_some_and(|s| s.handler().is_revoked(&subject_name(address)))
    }

    pub(crate) fn connect(&mut self, ctx: &mut NodeContext<'_>) {
        if self.state != ConnectionState::Offline {
            return;
        }
        self.state = ConnectionState::Joining;
        tracing::debug!(node = %self.sim_id, address = %self.address, remotes = self.remote_tas.len(), "Connecting");
        for ta in self.remote_tas.clone() {
            self.start_link(ctx, ta, None, ConnectionKind::Leaf);
        }
        if !self.stabilizing {
            self.stabilizing = true;
            let first = self
                .params
                .stabilize_interval
                .mul_f64(0.5 + ctx.rng.gen_f64());
            ctx.schedule(first, NodeTimer::Stabilize);
        }
    }

    /// Leaves cleanly, telling every connection.
    pub(crate) fn disconnect(&mut self, ctx: &mut NodeContext<'_>) {
        if matches!(
            self.state,
            ConnectionState::Leaving | ConnectionState::Disconnected
        ) {
            return;
        }
        self.state = ConnectionState::Leaving;
        for conn in self.table.clear() {
            ctx.send(
                conn.sim_id(),
                conn.via,
                Message::Close { from: self.address },
            );
        }
        self.shutdown();
    }

    /// Stops without notifying anyone.
    pub(crate) fn abort(&mut self) {
        self.table.clear();
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // dropping the sinks closes every waiting response channel
        self.rpc.drain();
        self.dht.clear();
        self.pending_links.clear();
        if let Some(pm) = &mut self.path_manager {
            pm.stop();
        }
        self.state = ConnectionState::Disconnected;
        tracing::debug!(node = %self.sim_id, "Disconnected");
    }

    pub(crate) fn handle(&mut self, ctx: &mut NodeContext<'_>, input: NodeInput) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        match input {
            NodeInput::Message { from, via, message } => self.on_message(ctx, from, via, message),
            NodeInput::Timer(timer) => self.on_timer(ctx, timer),
            NodeInput::EdgeFailure { remote } => self.on_edge_failure(ctx, remote),
        }
    }

    fn on_message(
        &mut self,
        ctx: &mut NodeContext<'_>,
        sender: SimId,
        via: Option<SimId>,
        message: Message,
    ) {
        match message {
            Message::LinkRequest {
                from,
                kind,
                certificate,
                relayed_by,
            } => self.on_link_request(ctx, from, kind, certificate, relayed_by),
            Message::LinkReply {
                from,
                kind,
                accepted,
                certificate,
                relayed_by,
            } => self.on_link_reply(ctx, from, kind, accepted, certificate, relayed_by),
            Message::RelayLink {
                requester,
                target,
                kind,
                certificate,
            } => self.on_relay_link(ctx, requester, target, kind, certificate),
            Message::RelayFailed { target } => self.on_relay_failed(target),
            Message::Close { from } => self.on_close(ctx, sender, from),
            Message::Announce { from, peers } => self.on_announce(ctx, from, peers),
            Message::CoordinateProbe {
                from: _,
                sent_at,
                coordinates: _,
            } => {
                if let Some(nc) = &self.coordinates {
                    let reply = Message::CoordinateReply {
                        from: self.address,
                        sent_at,
                        coordinates: nc.local(),
                    };
                    ctx.send(sender, via, reply);
                }
            }
            Message::CoordinateReply {
                from,
                sent_at,
                coordinates,
            } => {
                if let Some(nc) = &mut self.coordinates {
                    let rtt = Duration::from_nanos(ctx.now.saturating_sub(sent_at));
                    nc.sample(from, coordinates, rtt);
                }
            }
            Message::Routed(routed) => self.on_routed(ctx, routed),
            Message::Broadcast(broadcast) => self.on_broadcast(ctx, broadcast),
        }
    }

    fn on_timer(&mut self, ctx: &mut NodeContext<'_>, timer: NodeTimer) {
        match timer {
            NodeTimer::Stabilize => self.on_stabilize(ctx),
            NodeTimer::LinkTimeout(id) => {
                let expired = self.pending_links.get(&id).is_some_and(|p| {
                    ctx.now.saturating_sub(p.started_at)
                        >= crate::simulation::time::nanos(self.params.link_timeout)
                });
                if expired {
                    if let Some(link) = self.pending_links.remove(&id) {
                        tracing::trace!(node = %self.sim_id, target = %link.target, "Link attempt timed out");
                        if link.relayed {
                            *self.relay_attempts.entry(id).or_default() += 1;
                        }
                    }
                }
            }
            NodeTimer::RpcTimeout(call) => self.fail_call(call, RpcError::Timeout),
            NodeTimer::HandshakeTimeout(remote) => self.on_handshake_timeout(remote),
            NodeTimer::ProxyRefresh(id) => {
                if let Some(entry) = self.proxy.get(id).cloned() {
                    if let Err(err) = self.dht_put(ctx, entry.key, entry.value, entry.ttl, None) {
                        tracing::debug!(node = %self.sim_id, %err, "Proxy refresh failed");
                    }
                    ctx.schedule(dht::refresh_interval(entry.ttl), NodeTimer::ProxyRefresh(id));
                }
            }
        }
    }

    fn start_link(
        &mut self,
        ctx: &mut NodeContext<'_>,
        target: TransportAddress,
        address: Option<RingAddress>,
        kind: ConnectionKind,
    ) {
        let id = target.id();
        if id == self.sim_id || self.pending_links.contains_key(&id) {
            return;
        }
        match address {
            Some(addr) => {
                if self.is_revoked(&addr) || self.table.get(&addr).is_some_and(|c| c.kind >= kind)
                {
                    return;
                }
            }
            None => {
                if self.table.by_sim_id(id).is_some() {
                    return;
                }
            }
        }
        if self.listener.authorize(&target) == Decision::Deny {
            self.start_relayed_link(ctx, target, address, kind);
            return;
        }
        self.pending_links.insert(
            id,
            PendingLink {
                kind,
                target,
                relayed: false,
                started_at: ctx.now,
            },
        );
        let request = Message::LinkRequest {
            from: self.peer_info(),
            kind,
            certificate: self.local_certificate(),
            relayed_by: None,
        };
        ctx.send(id, None, request);
        ctx.schedule(self.params.link_timeout, NodeTimer::LinkTimeout(id));
    }

    fn start_relayed_link(
        &mut self,
        ctx: &mut NodeContext<'_>,
        target: TransportAddress,
        address: Option<RingAddress>,
        kind: ConnectionKind,
    ) {
        let id = target.id();
        let Some(relay) = self.pick_relay(&target, address.as_ref()) else {
            tracing::trace!(node = %self.sim_id, %target, "No relay available");
            return;
        };
        tracing::trace!(node = %self.sim_id, %target, %relay, "Linking through relay");
        let request = Message::RelayLink {
            requester: self.peer_info(),
            target: target.clone(),
            kind,
            certificate: self.local_certificate(),
        };
        self.pending_links.insert(
            id,
            PendingLink {
                kind,
                target,
                relayed: true,
                started_at: ctx.now,
            },
        );
        ctx.send(relay, None, request);
        ctx.schedule(self.params.link_timeout, NodeTimer::LinkTimeout(id));
    }

    /// Ranks direct connections as relay candidates and rotates through them
    /// on successive failures towards the same target.
    fn pick_relay(&self, target: &TransportAddress, address: Option<&RingAddress>) -> Option<SimId> {
        let overlap = self.relay_listener.as_ref()?.relay_overlap()?;
        let candidates: Vec<&Connection> = self
            .table
            .iter()
            .filter(|c| c.is_direct() && c.sim_id() != target.id())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let ranked: Vec<&Connection> = match (overlap, &self.coordinates) {
            (RelayOverlap::Coordinates, Some(nc)) => candidates
                .into_iter()
                .sorted_by_key(|c| nc.estimate(&c.address()).unwrap_or(Duration::MAX))
                .collect(),
            _ => match address {
                Some(addr) => candidates
                    .into_iter()
                    .sorted_by_key(|c| c.address().distance(addr))
                    .collect(),
                None => candidates,
            },
        };
        let attempt = self.relay_attempts.get(&target.id()).copied().unwrap_or(0);
        ranked.get(attempt % ranked.len()).map(|c| c.sim_id())
    }

    fn verify_edge(&self, relayed: bool, peer: &PeerInfo, certificate: Option<&Certificate>) -> bool {
        let secure = if relayed {
            self.relay_listener.as_ref().is_some_and(Listener::is_secure)
        } else {
            self.listener.is_secure()
        };
        if !secure {
            return true;
        }
        match (&self.security, certificate) {
            (Some(security), Some(cert)) => match security.handler().verify_remote(cert, &peer.address) {
                Ok(()) => true,
                Err(err) => {
                    tracing::debug!(node = %self.sim_id, remote = %peer.transport, %err, "Rejecting edge");
                    false
                }
            },
            _ => false,
        }
    }

    fn accept_link(
        &mut self,
        from: &PeerInfo,
        certificate: Option<&Certificate>,
        relayed_by: Option<SimId>,
    ) -> bool {
        if !self.is_active() || from.address == self.address || self.is_revoked(&from.address) {
            return false;
        }
        if self.path_manager.as_ref().is_some_and(|pm| !pm.is_running()) {
            return false;
        }
        match relayed_by {
            None => {
                if self.listener.authorize(&from.transport) == Decision::Deny {
                    tracing::trace!(node = %self.sim_id, remote = %from.transport, "Direct link denied");
                    return false;
                }
            }
            Some(_) if self.relay_listener.is_none() => return false,
            Some(_) => {}
        }
        self.verify_edge(relayed_by.is_some(), from, certificate)
    }

    fn on_link_request(
        &mut self,
        ctx: &mut NodeContext<'_>,
        from: PeerInfo,
        kind: ConnectionKind,
        certificate: Option<Certificate>,
        relayed_by: Option<SimId>,
    ) {
        let accepted = self.accept_link(&from, certificate.as_ref(), relayed_by);
        let reply = Message::LinkReply {
            from: self.peer_info(),
            kind,
            accepted,
            certificate: if accepted {
                self.local_certificate()
            } else {
                None
            },
            relayed_by,
        };
        ctx.send(from.sim_id(), relayed_by, reply);
        if accepted {
            self.add_connection(ctx, from, kind, relayed_by);
        }
    }

    fn on_link_reply(
        &mut self,
        ctx: &mut NodeContext<'_>,
        from: PeerInfo,
        kind: ConnectionKind,
        accepted: bool,
        certificate: Option<Certificate>,
        relayed_by: Option<SimId>,
    ) {
        let Some(pending) = self.pending_links.remove(&from.sim_id()) else {
            return;
        };
        if !accepted {
            if !pending.relayed {
                self.start_relayed_link(ctx, pending.target, Some(from.address), pending.kind);
            } else {
                *self.relay_attempts.entry(from.sim_id()).or_default() += 1;
            }
            return;
        }
        if !self.is_active()
            || self.is_revoked(&from.address)
            || !self.verify_edge(relayed_by.is_some(), &from, certificate.as_ref())
        {
            ctx.send(
                from.sim_id(),
                relayed_by,
                Message::Close { from: self.address },
            );
            return;
        }
        self.relay_attempts.remove(&from.sim_id());
        self.add_connection(ctx, from, kind.max(pending.kind), relayed_by);
    }

    fn on_relay_link(
        &mut self,
        ctx: &mut NodeContext<'_>,
        requester: PeerInfo,
        target: TransportAddress,
        kind: ConnectionKind,
        certificate: Option<Certificate>,
    ) {
        let reachable = self
            .table
            .by_sim_id(target.id())
            .is_some_and(Connection::is_direct);
        if !self.is_active() || !reachable {
            ctx.send(requester.sim_id(), None, Message::RelayFailed { target });
            return;
        }
        let forwarded = Message::LinkRequest {
            from: requester,
            kind,
            certificate,
            relayed_by: Some(self.sim_id),
        };
        ctx.send(target.id(), None, forwarded);
    }

    fn on_relay_failed(&mut self, target: TransportAddress) {
        let id = target.id();
        if self.pending_links.get(&id).is_some_and(|p| p.relayed) {
            self.pending_links.remove(&id);
            *self.relay_attempts.entry(id).or_default() += 1;
        }
    }

    fn add_connection(
        &mut self,
        ctx: &mut NodeContext<'_>,
        peer: PeerInfo,
        kind: ConnectionKind,
        via: Option<SimId>,
    ) {
        self.pending_links.remove(&peer.sim_id());
        self.departed.remove(&peer.address);
        self.known.insert(peer.address, peer.clone());
        let fresh = !self.table.contains(&peer.address);
        let changed = self.table.insert(Connection {
            peer: peer.clone(),
            kind,
            via,
            established_at: ctx.now,
        });
        if fresh {
            tracing::debug!(
                node = %self.sim_id,
                remote = %peer.transport,
                ?kind,
                relayed = via.is_some(),
                "Connection established"
            );
            if via.is_none() {
                if let (Some(pm), Some(local)) = (&mut self.path_manager, self.listener.local_address()) {
                    if let Some(path) = local.path() {
                        pm.record_edge(path);
                    }
                }
            }
        }
        if changed && kind.is_structured() {
            ctx.send(peer.sim_id(), via, self.announcement());
        }
        self.after_table_change(ctx);
    }

    fn on_close(&mut self, ctx: &mut NodeContext<'_>, sender: SimId, address: RingAddress) {
        if self.table.remove(&address).is_some() {
            tracing::debug!(node = %self.sim_id, remote = %sender, "Connection closed by remote");
        }
        self.known.remove(&address);
        self.departed.insert(address);
        self.pending_links.remove(&sender);
        self.after_table_change(ctx);
    }

    fn on_edge_failure(&mut self, ctx: &mut NodeContext<'_>, remote: SimId) {
        self.pending_links.remove(&remote);
        let dropped = self.table.remove_by_sim_id(remote);
        let gone: Vec<RingAddress> = self
            .known
            .values()
            .filter(|p| p.sim_id() == remote)
            .map(|p| p.address)
            .collect();
        for address in gone {
            self.known.remove(&address);
            self.departed.insert(address);
        }
        if !dropped.is_empty() {
            tracing::debug!(node = %self.sim_id, %remote, lost = dropped.len(), "Edge failed");
            self.after_table_change(ctx);
        }
    }

    fn after_table_change(&mut self, ctx: &mut NodeContext<'_>) {
        if !self.is_active() {
            return;
        }
        if !self.join_requested && !self.table.is_empty() {
            self.join_requested = true;
            self.send_connect_to_me(ctx, self.address, ConnectionKind::StructuredNear);
        }
        let previous = self.state;
        self.state = if self.left_neighbor().is_some() && self.right_neighbor().is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Joining
        };
        if previous != self.state {
            tracing::debug!(node = %self.sim_id, state = ?self.state, "State changed");
        }
        if self.state == ConnectionState::Connected && !self.shortcut_requested {
            self.request_shortcut(ctx);
        }
    }

    /// Nearest known peers on each side, the set this node wants as near
    /// neighbors.
    fn near_candidates(&self) -> Vec<PeerInfo> {
        let k = self.params.near_per_side;
        let peers = || {
            self.known
                .values()
                .filter(|p| p.address != self.address && !self.departed.contains(&p.address))
        };
        let clockwise = peers()
            .sorted_by_key(|p| self.address.clockwise_distance(&p.address))
            .take(k);
        let counter_clockwise = peers()
            .sorted_by_key(|p| p.address.clockwise_distance(&self.address))
            .take(k);
        clockwise
            .chain(counter_clockwise)
            .unique_by(|p| p.address)
            .cloned()
            .collect()
    }

    fn announcement(&self) -> Message {
        Message::Announce {
            from: self.peer_info(),
            peers: self.near_candidates(),
        }
    }

    fn on_announce(&mut self, ctx: &mut NodeContext<'_>, from: PeerInfo, peers: Vec<PeerInfo>) {
        if !self.is_active() {
            return;
        }
        for peer in std::iter::once(from).chain(peers) {
            if peer.address != self.address
                && !self.departed.contains(&peer.address)
                && !self.is_revoked(&peer.address)
            {
                self.known.entry(peer.address).or_insert(peer);
            }
        }
        self.reconcile_near(ctx);
    }

    fn reconcile_near(&mut self, ctx: &mut NodeContext<'_>) {
        for peer in self.near_candidates() {
            let linked = self
                .table
                .get(&peer.address)
                .is_some_and(|c| c.kind == ConnectionKind::StructuredNear);
            if !linked {
                self.start_link(
                    ctx,
                    peer.transport,
                    Some(peer.address),
                    ConnectionKind::StructuredNear,
                );
            }
        }
    }

    fn on_stabilize(&mut self, ctx: &mut NodeContext<'_>) {
        if !self.is_active() {
            self.stabilizing = false;
            return;
        }
        let announcement = self.announcement();
        for conn in self.table.iter() {
            ctx.send(conn.sim_id(), conn.via, announcement.clone());
        }
        if let Some(nc) = &self.coordinates {
            let probe = Message::CoordinateProbe {
                from: self.address,
                sent_at: ctx.now,
                coordinates: nc.local(),
            };
            for conn in self
                .table
                .iter()
                .filter(|c| c.kind == ConnectionKind::StructuredNear)
            {
                ctx.send(conn.sim_id(), conn.via, probe.clone());
            }
        }
        self.reconcile_near(ctx);
        if self.table.is_empty() {
            for ta in self.remote_tas.clone() {
                self.start_link(ctx, ta, None, ConnectionKind::Leaf);
            }
        }
        self.table_server.prune(ctx.now);
        ctx.schedule(self.params.stabilize_interval, NodeTimer::Stabilize);
    }

    fn request_shortcut(&mut self, ctx: &mut NodeContext<'_>) {
        self.shortcut_requested = true;
        // harmonic distance in [1/n, 1) of the ring, n estimated from known peers
        let estimate = (self.known.len() + 1).max(2) as f64;
        let fraction = (estimate.ln() * (ctx.rng.gen_f64() - 1.0)).exp();
        let offset = (fraction * 2f64.powi(128)) as u128;
        let target = self.address.wrapping_add(offset);
        self.send_connect_to_me(ctx, target, ConnectionKind::Shortcut);
    }

    /// Starts a broadcast over the whole ring. Returns how many connections
    /// it was handed to.
    pub(crate) fn broadcast(
        &mut self,
        ctx: &mut NodeContext<'_>,
        forwarders: Option<usize>,
        payload: BroadcastPayload,
    ) -> usize {
        let message = BroadcastMessage {
            source: self.address,
            from: self.address.wrapping_add(1),
            to: self.address.wrapping_sub(1),
            forwarders,
            hops: 0,
            payload,
        };
        let sent_to = self.forward_broadcast(ctx, &message);
        if let BroadcastPayload::Revocation(notice) = &message.payload {
            self.on_revocation(ctx, notice);
        }
        sent_to
    }

    fn forward_broadcast(&mut self, ctx: &mut NodeContext<'_>, message: &BroadcastMessage) -> usize {
        let targets =
            BroadcastSender::targets(&self.table, &message.from, &message.to, message.forwarders);
        for target in &targets {
            let forwarded = BroadcastMessage {
                from: target.from,
                to: target.to,
                hops: message.hops + 1,
                ..message.clone()
            };
            ctx.send(target.sim_id, target.via, Message::Broadcast(forwarded));
        }
        targets.len()
    }

    fn on_broadcast(&mut self, ctx: &mut NodeContext<'_>, message: BroadcastMessage) {
        let sent_to = self.forward_broadcast(ctx, &message);
        match message.payload {
            BroadcastPayload::Probe => ctx.notify(Notice::BroadcastReceived(BroadcastReceipt {
                receiver: self.sim_id,
                address: self.address,
                sent_to,
                hops: message.hops,
            })),
            BroadcastPayload::Revocation(notice) => self.on_revocation(ctx, &notice),
        }
    }

    fn on_revocation(&mut self, ctx: &mut NodeContext<'_>, notice: &RevocationNotice) {
        let Some(security) = &mut self.security else {
            return;
        };
        if !security.handler_mut().revoke(notice) {
            return;
        }
        let subject = notice.subject();
        tracing::debug!(node = %self.sim_id, subject, "Applying revocation");
        let closed = security.close_subject(subject);
        for (_, queued) in closed {
            for call in queued {
                self.fail_call(call, RpcError::Unauthorized);
            }
        }
        let revoked: Vec<Connection> = self
            .table
            .iter()
            .filter(|c| subject_name(&c.address()) == subject)
            .cloned()
            .collect();
        for conn in revoked {
            self.table.remove(&conn.address());
            ctx.send(
                conn.sim_id(),
                conn.via,
                Message::Close { from: self.address },
            );
        }
        let forgotten: Vec<RingAddress> = self
            .known
            .keys()
            .filter(|a| subject_name(a) == subject)
            .copied()
            .collect();
        for address in forgotten {
            self.known.remove(&address);
            self.departed.insert(address);
        }
        self.after_table_change(ctx);
    }

    pub(crate) fn dht_put(
        &mut self,
        ctx: &mut NodeContext<'_>,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
        sink: Option<oneshot::Sender<bool>>,
    ) -> Result<(), RpcError> {
        if !self.is_active() {
            return Err(RpcError::Closed);
        }
        let replicas = replica_addresses(&key, self.dht.degree());
        let op = self.dht.start(DhtOp::Put {
            outstanding: replicas.len(),
            acks: 0,
            replicas: replicas.len(),
            sink,
        });
        for replica in replicas {
            let request = RpcRequest::DhtPut {
                key: key.clone(),
                value: value.clone(),
                ttl,
            };
            if let Err(err) = self.invoke(ctx, Sender::Greedy(replica), ResponseSink::Dht { op }, request) {
                tracing::trace!(node = %self.sim_id, %err, "Replica put not sent");
                self.dht.record(op, false, Vec::new());
            }
        }
        Ok(())
    }

    pub(crate) fn dht_get(
        &mut self,
        ctx: &mut NodeContext<'_>,
        key: Vec<u8>,
        sink: mpsc::UnboundedSender<DhtValue>,
    ) -> Result<(), RpcError> {
        if !self.is_active() {
            return Err(RpcError::Closed);
        }
        let replicas = replica_addresses(&key, self.dht.degree());
        let op = self.dht.start(DhtOp::Get {
            outstanding: replicas.len(),
            seen: BTreeSet::new(),
            sink,
        });
        for replica in replicas {
            let request = RpcRequest::DhtGet { key: key.clone() };
            if let Err(err) = self.invoke(ctx, Sender::Greedy(replica), ResponseSink::Dht { op }, request) {
                tracing::trace!(node = %self.sim_id, %err, "Replica get not sent");
                self.dht.record(op, false, Vec::new());
            }
        }
        Ok(())
    }

    fn proxy_register(&mut self, ctx: &mut NodeContext<'_>, key: Vec<u8>, value: Vec<u8>, ttl: Duration) {
        if let Some(id) = self.proxy.register(key.clone(), value.clone(), ttl) {
            ctx.schedule(dht::refresh_interval(ttl), NodeTimer::ProxyRefresh(id));
        }
        if let Err(err) = self.dht_put(ctx, key, value, ttl, None) {
            tracing::debug!(node = %self.sim_id, %err, "Proxy put failed");
        }
    }
}

impl std::fmt::Debug for OverlayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayNode")
            .field("sim_id", &self.sim_id)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("connections", &self.table.len())
            .finish_non_exhaustive()
    }
}
