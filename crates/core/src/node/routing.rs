//! Greedy routing, request/response calls and security associations.

use super::{
    message::{Message, NodeTimer, Routed, RoutedPayload},
    rpc::{CallId, PendingCall, ResponseSink, RpcRequest, RpcResult, RpcValue, Sender},
    NodeContext, OverlayNode,
};
use crate::{
    errors::RpcError,
    ring::{Connection, ConnectionKind, PeerInfo, RingAddress},
    security::Certificate,
};

impl OverlayNode {
    /// Next hop for `routed`, or `None` when this node should take it.
    ///
    /// Connect-to-me requests never go back to their origin, and the origin
    /// itself always forwards them.
    fn next_hop(&self, routed: &Routed, originating: bool) -> Option<&Connection> {
        let connect_to_me = routed.payload.is_connect_to_me();
        let exclude = connect_to_me.then_some(routed.source.address);
        let best = self.table.closest_to(&routed.dest, exclude.as_ref())?;
        if originating && connect_to_me {
            return Some(best);
        }
        (best.address().distance(&routed.dest) < self.address.distance(&routed.dest)).then_some(best)
    }

    fn forward(&self, ctx: &mut NodeContext<'_>, conn: &Connection, routed: Routed) {
        let routed = Routed {
            hops: routed.hops + 1,
            ..routed
        };
        ctx.send(conn.sim_id(), conn.via, Message::Routed(routed));
    }

    /// Sends a message originating here.
    pub(super) fn send_routed(
        &mut self,
        ctx: &mut NodeContext<'_>,
        routed: Routed,
    ) -> Result<(), RpcError> {
        let connect_to_me = routed.payload.is_connect_to_me();
        let to_self = routed.dest == self.address && !connect_to_me;
        if !to_self {
            if let Some(conn) = self.next_hop(&routed, true) {
                self.forward(ctx, conn, routed);
                return Ok(());
            }
        }
        if to_self || !(routed.exact || connect_to_me) {
            // local delivery still goes through the scheduler
            ctx.send(self.sim_id, None, Message::Routed(routed));
            return Ok(());
        }
        Err(RpcError::NoRoute(routed.dest))
    }

    pub(super) fn on_routed(&mut self, ctx: &mut NodeContext<'_>, routed: Routed) {
        if routed.payload.is_connect_to_me() && routed.source.address == self.address {
            return;
        }
        if routed.dest != self.address {
            if let Some(conn) = self.next_hop(&routed, false) {
                self.forward(ctx, conn, routed);
                return;
            }
            if routed.exact {
                self.route_failed(ctx, routed);
                return;
            }
        }
        self.deliver(ctx, routed);
    }

    fn deliver(&mut self, ctx: &mut NodeContext<'_>, routed: Routed) {
        let Routed {
            source,
            payload,
            hops,
            ..
        } = routed;
        match payload {
            RoutedPayload::ConnectToMe { kind } => {
                tracing::trace!(node = %self.sim_id, origin = %source.transport, hops, ?kind, "Linking back to requester");
                self.start_link(ctx, source.transport, Some(source.address), kind);
            }
            RoutedPayload::Request {
                call,
                request,
                secure,
            } => self.serve_request(ctx, source, call, request, secure),
            RoutedPayload::Response { call, result } => {
                self.complete_call(call, result, source.address)
            }
            RoutedPayload::Handshake { stage, certificate } => {
                self.on_handshake(ctx, source, stage, certificate)
            }
        }
    }

    fn route_failed(&mut self, ctx: &mut NodeContext<'_>, routed: Routed) {
        match routed.payload {
            RoutedPayload::Request { call, .. } => {
                self.respond(ctx, routed.source.address, call, Err(RpcError::NoRoute(routed.dest)))
            }
            _ => tracing::trace!(node = %self.sim_id, dest = %routed.dest, "Dropping unroutable message"),
        }
    }

    pub(super) fn send_connect_to_me(
        &mut self,
        ctx: &mut NodeContext<'_>,
        dest: RingAddress,
        kind: ConnectionKind,
    ) {
        let routed = Routed {
            source: self.peer_info(),
            dest,
            exact: false,
            hops: 0,
            payload: RoutedPayload::ConnectToMe { kind },
        };
        if let Err(err) = self.send_routed(ctx, routed) {
            tracing::debug!(node = %self.sim_id, %err, ?kind, "Connect-to-me not sent");
        }
    }

    /// Issues a call. The outcome arrives through `sink`; the returned id
    /// identifies the call in traces.
    pub(crate) fn invoke(
        &mut self,
        ctx: &mut NodeContext<'_>,
        sender: Sender,
        sink: ResponseSink,
        request: RpcRequest,
    ) -> Result<CallId, RpcError> {
        if !self.is_active() {
            return Err(RpcError::Closed);
        }
        let dest = sender.destination();
        let secure = sender.is_secure();
        if secure && self.security.is_none() {
            return Err(RpcError::Unauthorized);
        }
        tracing::trace!(node = %self.sim_id, method = request.method(), %dest, secure, "Invoking");
        let call = self.rpc.register(PendingCall {
            sink,
            dest,
            request,
            secure,
            issued_at: ctx.now,
        });
        ctx.schedule(self.params.rpc_timeout, NodeTimer::RpcTimeout(call));

        let needs_association = secure && dest != self.address;
        let established = self
            .security
            .as_ref()
            .is_some_and(|s| s.is_established(&dest));
        let result = if !needs_association || established {
            self.dispatch_call(ctx, call)
        } else {
            let start = self
                .security
                .as_mut()
                .is_some_and(|s| s.enqueue(dest, call, ctx.now));
            if start {
                self.begin_handshake(ctx, dest)
            } else {
                Ok(())
            }
        };
        match result {
            Ok(()) => Ok(call),
            Err(err) => {
                self.rpc.take(&call);
                if needs_association && !established {
                    if let Some(security) = &mut self.security {
                        security.expire(&dest);
                    }
                }
                Err(err)
            }
        }
    }

    fn dispatch_call(&mut self, ctx: &mut NodeContext<'_>, call: CallId) -> Result<(), RpcError> {
        let Some(pending) = self.rpc.get(&call) else {
            return Ok(());
        };
        let routed = Routed {
            source: self.peer_info(),
            dest: pending.dest,
            exact: pending.secure,
            hops: 0,
            payload: RoutedPayload::Request {
                call,
                request: pending.request.clone(),
                secure: pending.secure,
            },
        };
        self.send_routed(ctx, routed)
    }

    pub(super) fn complete_call(
        &mut self,
        call: CallId,
        result: Result<RpcValue, RpcError>,
        responder: RingAddress,
    ) {
        let Some(pending) = self.rpc.take(&call) else {
            return;
        };
        match pending.sink {
            ResponseSink::Channel(tx) => match result {
                Ok(value) => {
                    let _ = tx.unbounded_send(RpcResult { value, responder });
                }
                Err(err) => {
                    tracing::trace!(node = %self.sim_id, %call, %err, method = pending.request.method(), "Call failed");
                }
            },
            ResponseSink::Dht { op } => match result {
                Ok(RpcValue::Bool(ack)) => self.dht.record(op, ack, Vec::new()),
                Ok(RpcValue::Values(values)) => self.dht.record(op, true, values),
                _ => self.dht.record(op, false, Vec::new()),
            },
        }
    }

    pub(super) fn fail_call(&mut self, call: CallId, err: RpcError) {
        self.complete_call(call, Err(err), self.address);
    }

    fn respond(
        &mut self,
        ctx: &mut NodeContext<'_>,
        caller: RingAddress,
        call: CallId,
        result: Result<RpcValue, RpcError>,
    ) {
        let routed = Routed {
            source: self.peer_info(),
            dest: caller,
            exact: true,
            hops: 0,
            payload: RoutedPayload::Response { call, result },
        };
        if let Err(err) = self.send_routed(ctx, routed) {
            tracing::trace!(node = %self.sim_id, %call, %err, "Dropping response");
        }
    }

    fn serve_request(
        &mut self,
        ctx: &mut NodeContext<'_>,
        caller: PeerInfo,
        call: CallId,
        request: RpcRequest,
        secure: bool,
    ) {
        let authorized = !secure
            || caller.address == self.address
            || self
                .security
                .as_ref()
                .is_some_and(|s| s.is_established(&caller.address));
        let result = if authorized {
            Ok(self.answer(ctx, request))
        } else {
            Err(RpcError::Unauthorized)
        };
        self.respond(ctx, caller.address, call, result);
    }

    fn answer(&mut self, ctx: &mut NodeContext<'_>, request: RpcRequest) -> RpcValue {
        match request {
            RpcRequest::Ping(value) => RpcValue::Int(value),
            RpcRequest::GetNeighbors => RpcValue::Neighbors {
                own: self.address,
                left: self.left_neighbor().map(Connection::address),
                right: self.right_neighbor().map(Connection::address),
            },
            RpcRequest::DhtPut { key, value, ttl } => {
                self.table_server
                    .put(key, value, super::dht::expiry(ctx.now, ttl));
                RpcValue::Bool(true)
            }
            RpcRequest::DhtGet { key } => RpcValue::Values(self.table_server.get(&key, ctx.now)),
            RpcRequest::ProxyRegister { key, value, ttl } => {
                self.proxy_register(ctx, key, value, ttl);
                RpcValue::Bool(true)
            }
            RpcRequest::ProxyUnregister { key, value } => {
                RpcValue::Bool(self.proxy.unregister(&key, &value))
            }
        }
    }

    fn begin_handshake(&mut self, ctx: &mut NodeContext<'_>, remote: RingAddress) -> Result<(), RpcError> {
        let Some(certificate) = self.local_certificate() else {
            return Err(RpcError::Unauthorized);
        };
        tracing::trace!(node = %self.sim_id, %remote, "Starting handshake");
        ctx.schedule(self.params.rpc_timeout, NodeTimer::HandshakeTimeout(remote));
        let routed = Routed {
            source: self.peer_info(),
            dest: remote,
            exact: true,
            hops: 0,
            payload: RoutedPayload::Handshake {
                stage: 0,
                certificate,
            },
        };
        self.send_routed(ctx, routed)
    }

    /// Even stages are handled by the responder, odd ones by the initiator.
    fn on_handshake(
        &mut self,
        ctx: &mut NodeContext<'_>,
        source: PeerInfo,
        stage: u8,
        certificate: Certificate,
    ) {
        let now = ctx.now;
        let Some(security) = &mut self.security else {
            return;
        };
        if let Err(err) = security.handler().verify_remote(&certificate, &source.address) {
            tracing::debug!(node = %self.sim_id, remote = %source.transport, %err, "Handshake rejected");
            return;
        }
        let final_stage = security.style().final_stage();
        let responder = stage % 2 == 0;
        let complete = if responder {
            stage + 1 == final_stage
        } else {
            stage == final_stage
        };
        let queued = if complete {
            security.establish(source.address, now)
        } else {
            if responder {
                security.accept(source.address, now);
            }
            Vec::new()
        };
        let local = security.handler().local_certificate().clone();

        if stage < final_stage {
            let reply = Routed {
                source: self.peer_info(),
                dest: source.address,
                exact: true,
                hops: 0,
                payload: RoutedPayload::Handshake {
                    stage: stage + 1,
                    certificate: local,
                },
            };
            if let Err(err) = self.send_routed(ctx, reply) {
                tracing::debug!(node = %self.sim_id, %err, "Handshake reply not sent");
            }
        }
        if complete {
            tracing::debug!(node = %self.sim_id, remote = %source.address, flushed = queued.len(), "Security association established");
        }
        for call in queued {
            if let Err(err) = self.dispatch_call(ctx, call) {
                self.fail_call(call, err);
            }
        }
    }

    pub(super) fn on_handshake_timeout(&mut self, remote: RingAddress) {
        let still_pending = self
            .security
            .as_ref()
            .is_some_and(|s| s.association(&remote).is_some() && !s.is_established(&remote));
        if !still_pending {
            return;
        }
        if let Some(queued) = self.security.as_mut().and_then(|s| s.expire(&remote)) {
            tracing::debug!(node = %self.sim_id, %remote, "Handshake timed out");
            for call in queued {
                self.fail_call(call, RpcError::Timeout);
            }
        }
    }
}
