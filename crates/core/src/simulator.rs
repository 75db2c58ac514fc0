//! Simulation driver.
//!
//! [`Simulator`] owns the event queue, the node registry and the trust
//! authority. Every driver-level operation (growing or shrinking the network,
//! waiting for the ring, running a measurement) is a loop that pumps the event
//! queue one step at a time and checks its own completion condition between
//! steps, bounded by the configured wait budget in simulated time.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::channel::mpsc;

use crate::{
    bootstrap::{evaluation_remote_tas, OverlayBootstrapper},
    config::SimulationConfig,
    errors::{RpcError, SimulationError},
    node::{
        message::{BroadcastPayload, Effects, Message, NodeInput, NodeTimer, Notice},
        rpc::{ResponseSink, RpcChannel, RpcRequest, RpcResult, Sender},
        ConnectionState, NodeContext, OverlayNode,
    },
    protocols::{
        AllToAllHelper, AllToAllReport, BroadcastHelper, BroadcastStats, CrawlHelper, CrawlReport,
        DhtGet, DhtPut, MissingNode, RingVerifier,
    },
    registry::{AddressSpace, NodeRecord, NodeRegistry},
    ring::{ConnectionKind, RingAddress},
    security::{subject_name, TrustManager},
    simulation::{time::nanos, Scheduler},
    transport::{LatencyMap, SimId},
};

#[derive(Debug)]
pub(crate) enum SimEvent {
    Deliver {
        from: SimId,
        to: SimId,
        via: Option<SimId>,
        message: Message,
    },
    Timer {
        node: SimId,
        timer: NodeTimer,
    },
    EdgeFailure {
        node: SimId,
        remote: SimId,
    },
}

/// Outcome of [`Simulator::revoke`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub victim: SimId,
    pub victim_address: RingAddress,
    pub revoker: SimId,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateReport {
    pub states: Vec<(SimId, RingAddress, ConnectionState)>,
    pub connected: usize,
}

impl fmt::Display for ConnectionStateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, address, state) in &self.states {
            writeln!(f, "{id} {address}: {state:?}")?;
        }
        write!(f, "Connected: {}", self.connected)
    }
}

pub struct Simulator {
    config: SimulationConfig,
    scheduler: Scheduler<SimEvent>,
    registry: NodeRegistry,
    address_space: AddressSpace,
    bootstrapper: OverlayBootstrapper,
    latency: LatencyMap,
    broadcast: Option<BroadcastHelper>,
}

impl Simulator {
    /// Creates the simulator and starts `config.size` nodes.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        let mut sim = Self::new_unstarted(config)?;
        sim.start_network()?;
        Ok(sim)
    }

    /// Creates an empty simulator; nodes are added with [`Simulator::add_node`].
    pub fn new_unstarted(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let scheduler = Scheduler::new(config.seed);
        let rng = scheduler.rng().clone();
        let latency = match &config.latency_map {
            Some(path) => LatencyMap::load(config.base_latency, path)
                .map_err(|err| SimulationError::Config(format!("{err:#}")))?,
            None => LatencyMap::uniform(config.base_latency),
        };
        let bootstrapper = OverlayBootstrapper::new(&config, rng.child())?;
        Ok(Self {
            address_space: AddressSpace::new(rng.child()),
            config,
            scheduler,
            registry: NodeRegistry::new(),
            bootstrapper,
            latency,
            broadcast: None,
        })
    }

    fn start_network(&mut self) -> Result<(), SimulationError> {
        tracing::info!(
            size = self.config.size,
            seed = self.config.seed,
            evaluation = self.config.evaluation,
            "Starting network"
        );
        if !self.config.evaluation {
            for _ in 0..self.config.size {
                self.add_node()?;
            }
            return Ok(());
        }
        for _ in 0..self.config.size {
            let id = self.address_space.allocate_id(&self.registry);
            let address = self.address_space.generate_address(&self.registry)?;
            self.bootstrapper.bootstrap(&mut self.registry, id, address)?;
        }
        for (id, tas) in evaluation_remote_tas(&self.registry) {
            if let Some(record) = self.registry.get_by_id_mut(id) {
                record.node.set_remote_tas(tas);
            }
        }
        let ids: Vec<SimId> = self.registry.ids().collect();
        for id in ids {
            self.start_node(id)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn trust(&self) -> Option<&TrustManager> {
        self.bootstrapper.trust()
    }

    /// Current simulated time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    pub fn processed_events(&self) -> u64 {
        self.scheduler.processed_count()
    }

    pub fn node(&self, id: SimId) -> Option<&OverlayNode> {
        self.registry.get_by_id(id).map(|r| &r.node)
    }

    /// Record at `index` in ring-address order.
    pub fn node_at(&self, index: usize) -> Result<&NodeRecord, SimulationError> {
        self.registry.index(index)
    }

    pub fn add_node(&mut self) -> Result<SimId, SimulationError> {
        let id = self.address_space.allocate_id(&self.registry);
        let address = self.address_space.generate_address(&self.registry)?;
        self.add_node_with(id, address)
    }

    pub fn add_node_with(&mut self, id: SimId, address: RingAddress) -> Result<SimId, SimulationError> {
        self.bootstrapper.bootstrap(&mut self.registry, id, address)?;
        self.start_node(id)?;
        Ok(id)
    }

    fn start_node(&mut self, id: SimId) -> Result<(), SimulationError> {
        let address = self
            .registry
            .get_by_id(id)
            .map(|r| r.address)
            .ok_or_else(|| SimulationError::UnknownNode(id.to_string()))?;
        self.registry.mark_live(&address);
        self.with_node(id, |node, ctx| node.connect(ctx));
        Ok(())
    }

    /// Takes a node out of the network. A clean removal tells its
    /// connections; otherwise they find out when sends to it fail.
    pub fn remove_node(&mut self, address: &RingAddress, cleanly: bool) -> Result<SimId, SimulationError> {
        let id = self
            .registry
            .get(address)
            .map(|r| r.id)
            .ok_or_else(|| SimulationError::UnknownNode(address.to_string()))?;
        if cleanly {
            self.with_node(id, |node, ctx| node.disconnect(ctx));
        } else {
            self.with_node(id, |node, _| node.abort());
        }
        self.registry.remove(address)?;
        tracing::debug!(node = %id, %address, cleanly, "Removed node");
        Ok(id)
    }

    pub fn remove_random_node(&mut self, cleanly: bool) -> Result<SimId, SimulationError> {
        if self.registry.is_empty() {
            return Err(SimulationError::NotEnoughNodes { needed: 1, found: 0 });
        }
        let index = self.scheduler.rng().gen_range(0..self.registry.len());
        let address = self.registry.index(index)?.address;
        self.remove_node(&address, cleanly)
    }

    /// Disconnects every node and empties the registry.
    pub fn disconnect(&mut self) {
        let ids: Vec<SimId> = self.registry.ids().collect();
        for id in ids {
            self.with_node(id, |node, ctx| node.disconnect(ctx));
        }
        self.registry.drain();
        self.scheduler.drain_pending();
        self.broadcast = None;
    }

    fn with_node<R>(
        &mut self,
        id: SimId,
        f: impl FnOnce(&mut OverlayNode, &mut NodeContext<'_>) -> R,
    ) -> Option<R> {
        let now = self.scheduler.now();
        let rng = self.scheduler.rng().clone();
        let mut effects = Effects::default();
        let record = self.registry.get_by_id_mut(id)?;
        let result = {
            let mut ctx = NodeContext::new(now, &rng, &mut effects);
            f(&mut record.node, &mut ctx)
        };
        self.apply_effects(id, effects);
        Some(result)
    }

    fn apply_effects(&mut self, node: SimId, effects: Effects) {
        for outgoing in effects.outgoing {
            let delay = match outgoing.via {
                _ if outgoing.to == node => Duration::ZERO,
                Some(relay) => self.latency.relayed(node, relay, outgoing.to),
                None => self.latency.latency(node, outgoing.to),
            };
            self.scheduler.schedule_after(
                delay,
                SimEvent::Deliver {
                    from: node,
                    to: outgoing.to,
                    via: outgoing.via,
                    message: outgoing.message,
                },
            );
        }
        for (after, timer) in effects.timers {
            self.scheduler
                .schedule_after(after, SimEvent::Timer { node, timer });
        }
        let now = self.scheduler.now();
        for notice in effects.notices {
            match notice {
                Notice::BroadcastReceived(receipt) => {
                    if let Some(helper) = &mut self.broadcast {
                        helper.record(now, receipt);
                    }
                }
            }
        }
    }

    /// Processes one event. Returns `false` when the queue is empty.
    pub fn run_step(&mut self) -> bool {
        let Some(event) = self.scheduler.step() else {
            return false;
        };
        match event.payload {
            SimEvent::Deliver {
                from,
                to,
                via,
                message,
            } => {
                let gone = via
                    .filter(|relay| !self.registry.contains_id(*relay))
                    .or_else(|| (!self.registry.contains_id(to)).then_some(to));
                match gone {
                    Some(remote) => {
                        if from != remote && self.registry.contains_id(from) {
                            let delay = self.latency.latency(remote, from);
                            self.scheduler.schedule_after(
                                delay,
                                SimEvent::EdgeFailure { node: from, remote },
                            );
                        }
                    }
                    None => {
                        self.with_node(to, |node, ctx| {
                            node.handle(ctx, NodeInput::Message { from, via, message })
                        });
                    }
                }
            }
            SimEvent::Timer { node, timer } => {
                self.with_node(node, |n, ctx| n.handle(ctx, NodeInput::Timer(timer)));
            }
            SimEvent::EdgeFailure { node, remote } => {
                self.with_node(node, |n, ctx| n.handle(ctx, NodeInput::EdgeFailure { remote }));
            }
        }
        true
    }

    /// Processes every event due within `duration`, then moves the clock to
    /// its end.
    pub fn run_for(&mut self, duration: Duration) {
        let target = self.scheduler.now().saturating_add(nanos(duration));
        while self
            .scheduler
            .next_event_time()
            .is_some_and(|t| t <= target)
        {
            self.run_step();
        }
        self.scheduler.advance_idle(target);
    }

    /// Steps until `done` holds or `budget` of simulated time has passed.
    fn run_until(&mut self, budget: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let deadline = self.scheduler.now().saturating_add(nanos(budget));
        loop {
            if done(self) {
                return true;
            }
            match self.scheduler.next_event_time() {
                Some(t) if t <= deadline => {
                    self.run_step();
                }
                _ => {
                    self.scheduler.advance_idle(deadline);
                    return done(self);
                }
            }
        }
    }

    pub fn check_ring(&self) -> bool {
        RingVerifier::new(&self.registry).check_ring()
    }

    pub fn find_missing(&self) -> Vec<MissingNode> {
        RingVerifier::new(&self.registry)
            .find_missing()
            .into_iter()
            .collect()
    }

    /// Pumps the network until the ring is consistent. Returns whether it got
    /// there within the wait budget.
    pub fn complete(&mut self, quiet: bool) -> bool {
        let started = self.scheduler.now();
        let formed = self.run_until(self.config.max_wait, |sim| sim.check_ring());
        let elapsed = Duration::from_nanos(self.scheduler.now() - started);
        if formed {
            if !quiet {
                tracing::info!(?elapsed, nodes = self.registry.len(), "Ring formed");
            }
        } else {
            tracing::warn!(?elapsed, missing = self.find_missing().len(), "Ring did not form");
            if self.config.verbose {
                self.print_connections();
                tracing::info!("{}", self.connection_state_report());
            }
        }
        formed
    }

    /// Logs every node's structured connections.
    pub fn print_connections(&self) {
        for record in self.registry.iter() {
            let structured: Vec<String> = record
                .node
                .connections()
                .structured()
                .map(|c| c.to_string())
                .collect();
            tracing::info!(
                node = %record.id,
                address = %record.address,
                left = ?record.node.left_neighbor().map(|c| c.address()),
                right = ?record.node.right_neighbor().map(|c| c.address()),
                connections = ?structured,
                "Connections"
            );
        }
    }

    pub fn connection_state_report(&self) -> ConnectionStateReport {
        let states: Vec<_> = self
            .registry
            .iter()
            .map(|r| (r.id, r.address, r.node.state()))
            .collect();
        let connected = states
            .iter()
            .filter(|(_, _, s)| *s == ConnectionState::Connected)
            .count();
        ConnectionStateReport { states, connected }
    }

    /// Broadcast from a random node.
    pub fn broadcast(&mut self, forwarders: Option<usize>) -> Result<BroadcastStats, SimulationError> {
        if self.registry.is_empty() {
            return Err(SimulationError::NotEnoughNodes { needed: 1, found: 0 });
        }
        let index = self.scheduler.rng().gen_range(0..self.registry.len());
        self.broadcast_from(index, forwarders)
    }

    /// Broadcasts from the node at `index` and waits until no receiver has
    /// reported for a full quiescence window.
    pub fn broadcast_from(
        &mut self,
        index: usize,
        forwarders: Option<usize>,
    ) -> Result<BroadcastStats, SimulationError> {
        let root = self.registry.index(index)?.id;
        let started = self.scheduler.now();
        self.broadcast = Some(BroadcastHelper::new(
            root,
            forwarders,
            self.config.quiescence,
            started,
        ));
        let sent = self
            .with_node(root, |node, ctx| {
                node.broadcast(ctx, forwarders, BroadcastPayload::Probe)
            })
            .unwrap_or(0);
        if let Some(helper) = &mut self.broadcast {
            helper.set_root_sent_to(sent);
        }

        let limit = started.saturating_add(nanos(self.config.max_wait));
        loop {
            let deadline = self
                .broadcast
                .as_ref()
                .map_or(started, BroadcastHelper::deadline)
                .min(limit);
            match self.scheduler.next_event_time() {
                Some(t) if t <= deadline => {
                    self.run_step();
                }
                _ => {
                    self.scheduler.advance_idle(deadline);
                    break;
                }
            }
        }

        let helper = self
            .broadcast
            .take()
            .ok_or_else(|| SimulationError::UnknownNode(root.to_string()))?;
        if let Some(path) = &self.config.output {
            helper.write_results(path)?;
        }
        let stats = helper.finish();
        tracing::info!(
            root = %stats.root,
            average = stats.average_hops,
            stddev = stats.stddev_hops,
            hits = stats.hits,
            max_hops = stats.max_hops,
            "Broadcast finished"
        );
        Ok(stats)
    }

    /// Opens a response channel and issues `request` from node `from`.
    pub fn invoke(
        &mut self,
        from: SimId,
        sender: Sender,
        request: RpcRequest,
    ) -> Result<mpsc::UnboundedReceiver<RpcResult>, SimulationError> {
        let (tx, rx) = crate::node::rpc::channel();
        self.invoke_channel(from, sender, tx, request)?;
        Ok(rx)
    }

    fn invoke_channel(
        &mut self,
        from: SimId,
        sender: Sender,
        tx: RpcChannel,
        request: RpcRequest,
    ) -> Result<(), RpcError> {
        self.with_node(from, |node, ctx| {
            node.invoke(ctx, sender, ResponseSink::Channel(tx), request)
                .map(|_| ())
        })
        .unwrap_or(Err(RpcError::Closed))
    }

    fn check_secure(&self, secure: bool) -> Result<(), SimulationError> {
        if secure && !self.config.is_secure() {
            return Err(SimulationError::SecurityDisabled);
        }
        Ok(())
    }

    /// Walks the ring from the first node through `GetNeighbors` calls.
    pub fn crawl(&mut self, secure: bool) -> Result<CrawlReport, SimulationError> {
        self.check_secure(secure)?;
        let origin = self.registry.index(0)?;
        let (origin_id, origin_address) = (origin.id, origin.address);
        let mut helper = CrawlHelper::new(
            origin_address,
            self.registry.len(),
            secure,
            self.scheduler.now(),
        );
        let deadline = self.scheduler.now().saturating_add(nanos(self.config.max_wait));
        loop {
            let now = self.scheduler.now();
            let finished = helper
                .poll(now, |sender, tx| {
                    self.invoke_channel(origin_id, sender, tx, RpcRequest::GetNeighbors)
                })
                .is_some();
            if finished {
                break;
            }
            match self.scheduler.next_event_time() {
                Some(t) if t <= deadline => {
                    self.run_step();
                }
                _ => break,
            }
        }
        let report = helper.abandon(self.scheduler.now());
        if !report.success && self.config.verbose {
            self.print_connections();
            tracing::info!("{}", self.connection_state_report());
        }
        Ok(report)
    }

    /// Pings every ordered pair of nodes at once and waits for the answers.
    pub fn all_to_all(&mut self, secure: bool) -> Result<AllToAllReport, SimulationError> {
        self.check_secure(secure)?;
        let nodes: Vec<(SimId, RingAddress)> =
            self.registry.iter().map(|r| (r.id, r.address)).collect();
        let mut helper = AllToAllHelper::new(nodes.len(), self.scheduler.now());
        for (from, _) in &nodes {
            for (to, address) in &nodes {
                if from == to {
                    continue;
                }
                let sender = if secure {
                    Sender::Secure(*address)
                } else {
                    Sender::Greedy(*address)
                };
                let issued = helper.issue(|tx| {
                    self.invoke_channel(*from, sender, tx, RpcRequest::Ping(0))
                });
                if let Err(err) = issued {
                    tracing::debug!(%from, %to, %err, "Ping not sent");
                }
            }
        }

        let deadline = self.scheduler.now().saturating_add(nanos(self.config.max_wait));
        loop {
            if let Some(report) = helper.poll(self.scheduler.now()) {
                return Ok(report);
            }
            match self.scheduler.next_event_time() {
                Some(t) if t <= deadline => {
                    self.run_step();
                }
                _ => return Err(RpcError::Timeout.into()),
            }
        }
    }

    /// Revokes a random node's certificate, broadcast from a different random
    /// node. The revocation spreads as the simulation keeps running.
    pub fn revoke(&mut self) -> Result<Revocation, SimulationError> {
        if self.bootstrapper.trust().is_none() {
            return Err(SimulationError::SecurityDisabled);
        }
        let len = self.registry.len();
        if len < 2 {
            return Err(SimulationError::NotEnoughNodes {
                needed: 2,
                found: len,
            });
        }
        let rng = self.scheduler.rng().clone();
        let victim_index = rng.gen_range(0..len);
        let revoker_index = (victim_index + 1 + rng.gen_range(0..len - 1)) % len;
        let victim = self.registry.index(victim_index)?;
        let (victim_id, victim_address) = (victim.id, victim.address);
        let revoker = self.registry.index(revoker_index)?.id;

        let subject = subject_name(&victim_address);
        let notice = self
            .bootstrapper
            .trust_mut()
            .ok_or(SimulationError::SecurityDisabled)?
            .revoke(&subject)?;
        tracing::info!(victim = %victim_id, %revoker, %subject, "Revoking certificate");
        self.with_node(revoker, |node, ctx| {
            node.broadcast(ctx, None, BroadcastPayload::Revocation(notice))
        });
        Ok(Revocation {
            victim: victim_id,
            victim_address,
            revoker,
            subject,
        })
    }

    /// Stores `value` under `key` from node `from`.
    pub fn put(
        &mut self,
        from: SimId,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<DhtPut, SimulationError> {
        let (tx, put) = DhtPut::channel();
        self.with_node(from, |node, ctx| {
            node.dht_put(ctx, key.to_vec(), value.to_vec(), ttl, Some(tx))
        })
        .ok_or_else(|| SimulationError::UnknownNode(from.to_string()))??;
        Ok(put)
    }

    pub fn get(&mut self, from: SimId, key: &[u8]) -> Result<DhtGet, SimulationError> {
        let (tx, get) = DhtGet::channel();
        self.with_node(from, |node, ctx| node.dht_get(ctx, key.to_vec(), tx))
            .ok_or_else(|| SimulationError::UnknownNode(from.to_string()))??;
        Ok(get)
    }

    /// Runs the simulation until `future` resolves. `None` when it is still
    /// pending once the wait budget is spent or no events are left.
    pub fn block_on<F: Future + Unpin>(&mut self, mut future: F) -> Option<F::Output> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let deadline = self.scheduler.now().saturating_add(nanos(self.config.max_wait));
        loop {
            if let Poll::Ready(output) = Pin::new(&mut future).poll(&mut cx) {
                return Some(output);
            }
            match self.scheduler.next_event_time() {
                Some(t) if t <= deadline => {
                    self.run_step();
                }
                _ => return None,
            }
        }
    }

    /// Structured neighbors each node currently links to, in address order.
    pub fn structured_degree(&self) -> Vec<(SimId, usize)> {
        self.registry
            .iter()
            .map(|r| {
                let near = r
                    .node
                    .connections()
                    .iter()
                    .filter(|c| c.kind == ConnectionKind::StructuredNear)
                    .count();
                (r.id, near)
            })
            .collect()
    }
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("nodes", &self.registry.len())
            .field("now", &self.scheduler.now())
            .field("pending", &self.scheduler.pending_count())
            .finish_non_exhaustive()
    }
}
