//! In-process network of workers driven by a virtual clock.
//!
//! Every node is a real [`NetworkWorker`]; only the transport is simulated.
//! Actions a worker emits are turned into events for the peers they
//! address, in FIFO order, until the network is quiet. Time moves only when
//! a test calls [`SimNetwork::advance`], so deadlines can be hit exactly.

use libp2p::futures::FutureExt;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;
use weft_core::error::OutboundFailure;
use weft_core::{MemoryChain, SessionInfoProvider};
use weft_network::{
    Event, NetworkConfig, NetworkService, NetworkState, NetworkWorker, PeerInfo, RequestId, SyncMode,
    TransportAction, TransportEvent,
};
use weft_network::protocol::WireResponse;

/// Rewrites a node's response payloads: `(protocol, payload) -> payload`.
pub type Tamper = Box<dyn FnMut(&str, Vec<u8>) -> Vec<u8>>;

/// Upper bound on delivery rounds in one [`SimNetwork::settle`].
const MAX_ROUNDS: usize = 100_000;

pub struct SimNode {
    pub peer_id: PeerId,
    pub address: Multiaddr,
    pub chain: Arc<MemoryChain>,
    pub service: NetworkService,
    worker: NetworkWorker,
    events: broadcast::Receiver<Event>,
    /// Requests to a silenced node are swallowed.
    silenced: bool,
    /// Protocols this node swallows requests for.
    muted: HashSet<String>,
    tamper: Option<Tamper>,
}

/// An inbound request waiting for its response.
struct Pending {
    requester: usize,
    request_id: RequestId,
    protocol: String,
}

pub struct SimNetwork {
    nodes: Vec<SimNode>,
    index: HashMap<PeerId, usize>,
    links: BTreeSet<(usize, usize)>,
    pending: HashMap<(usize, RequestId), Pending>,
    next_inbound: u64,
    queue: VecDeque<(usize, TransportEvent)>,
    start: Instant,
    now: Instant,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn link(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl SimNetwork {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            links: BTreeSet::new(),
            pending: HashMap::new(),
            next_inbound: 0,
            queue: VecDeque::new(),
            start: now,
            now,
        }
    }

    /// Add a node and return its index.
    pub fn add_node(
        &mut self,
        config: NetworkConfig,
        chain: Arc<MemoryChain>,
        sessions: Arc<dyn SessionInfoProvider>,
    ) -> usize {
        let id = self.nodes.len();
        let peer_id = PeerId::random();
        let address = Multiaddr::empty().with(Protocol::Memory(id as u64 + 1));
        let (mut worker, service) = NetworkWorker::new(config, peer_id, chain.clone(), sessions);
        let events = service.event_stream();
        worker.handle_transport_event(TransportEvent::NewListenAddr(address.clone()), self.now);
        self.index.insert(peer_id, id);
        self.nodes.push(SimNode {
            peer_id,
            address,
            chain,
            service,
            worker,
            events,
            silenced: false,
            muted: HashSet::new(),
            tamper: None,
        });
        id
    }

    pub fn node(&self, id: usize) -> &SimNode {
        &self.nodes[id]
    }

    pub fn peer_id(&self, id: usize) -> PeerId {
        self.nodes[id].peer_id
    }

    pub fn service(&self, id: usize) -> &NetworkService {
        &self.nodes[id].service
    }

    pub fn chain(&self, id: usize) -> &Arc<MemoryChain> {
        &self.nodes[id].chain
    }

    pub fn sync_mode(&self, id: usize) -> SyncMode {
        self.nodes[id].worker.sync_mode()
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Virtual time since the network was created.
    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    pub fn is_linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&link(a, b))
    }

    /// Stop `id` from answering requests. Its peers see timeouts.
    pub fn silence(&mut self, id: usize, silenced: bool) {
        self.nodes[id].silenced = silenced;
    }

    /// Swallow requests for `protocol` only.
    pub fn mute(&mut self, id: usize, protocol: &str) {
        self.nodes[id].muted.insert(protocol.to_string());
    }

    pub fn set_tamper(&mut self, id: usize, tamper: Tamper) {
        self.nodes[id].tamper = Some(tamper);
    }

    /// Ask `from` to dial `to`, then deliver everything that follows.
    pub fn connect(&mut self, from: usize, to: usize) {
        let (peer, address) = (self.nodes[to].peer_id, self.nodes[to].address.clone());
        // The dial is queued when the call is made; its outcome shows up
        // in the link table.
        drop(self.nodes[from].service.connect(peer, vec![address]));
        self.settle();
    }

    /// `id`'s view of its peers.
    pub fn peers(&mut self, id: usize) -> Vec<PeerInfo> {
        let reply = self.nodes[id].service.peers();
        self.settle();
        reply.now_or_never().and_then(Result::ok).unwrap_or_default()
    }

    pub fn network_state(&mut self, id: usize) -> Option<NetworkState> {
        let reply = self.nodes[id].service.network_state();
        self.settle();
        reply.now_or_never().and_then(Result::ok)
    }

    /// Reputation `observer` holds for `subject`, if connected.
    pub fn score(&mut self, observer: usize, subject: usize) -> Option<i32> {
        let peer = self.nodes[subject].peer_id;
        self.peers(observer)
            .into_iter()
            .find(|info| info.peer_id == peer)
            .map(|info| info.reputation)
    }

    /// Events published by `id` since the last call.
    pub fn events(&mut self, id: usize) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            match self.nodes[id].events.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }

    /// Deliver commands and transport traffic until nothing moves.
    pub fn settle(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut moved = false;
            for id in 0..self.nodes.len() {
                self.nodes[id].worker.process_commands(self.now);
                for action in self.nodes[id].worker.drain_actions() {
                    moved = true;
                    self.route(id, action);
                }
            }
            while let Some((id, event)) = self.queue.pop_front() {
                moved = true;
                trace!(node = id, ?event, "sim: deliver");
                self.nodes[id].worker.handle_transport_event(event, self.now);
            }
            if !moved {
                return;
            }
        }
        panic!("simulated network did not settle");
    }

    /// Run one tick on every node at the current time.
    pub fn tick(&mut self) {
        self.settle();
        for node in &mut self.nodes {
            node.worker.tick(self.now);
        }
        self.settle();
    }

    /// Move the clock forward by `by`, then tick.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.tick();
    }

    /// Advance in `step`s until `done` holds or `limit` of virtual time
    /// passed. Returns whether `done` held.
    pub fn run_until(&mut self, step: Duration, limit: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if done(self) {
                return true;
            }
            self.advance(step);
        }
        done(self)
    }

    /// Drive the network until `future` completes, ticking every `step`.
    pub fn block_on<F: Future + Unpin>(&mut self, step: Duration, limit: Duration, mut future: F) -> Option<F::Output> {
        let deadline = self.now + limit;
        loop {
            self.settle();
            if let Some(out) = (&mut future).now_or_never() {
                return Some(out);
            }
            if self.now >= deadline {
                return None;
            }
            self.advance(step);
        }
    }

    fn push(&mut self, to: usize, event: TransportEvent) {
        self.queue.push_back((to, event));
    }

    fn route(&mut self, from: usize, action: TransportAction) {
        let from_peer = self.nodes[from].peer_id;
        match action {
            TransportAction::Dial { peer, .. } => {
                let Some(&to) = self.index.get(&peer).filter(|to| **to != from) else {
                    self.push(
                        from,
                        TransportEvent::DialFailure {
                            peer,
                            error: "no such node".into(),
                        },
                    );
                    return;
                };
                if !self.links.insert(link(from, to)) {
                    return;
                }
                let (from_addr, to_addr) = (self.nodes[from].address.clone(), self.nodes[to].address.clone());
                self.push(
                    from,
                    TransportEvent::ConnectionEstablished {
                        peer,
                        address: Some(to_addr.clone()),
                        inbound: false,
                    },
                );
                self.push(
                    to,
                    TransportEvent::ConnectionEstablished {
                        peer: from_peer,
                        address: None,
                        inbound: true,
                    },
                );
                // What Identify would report.
                self.push(from, TransportEvent::AddressDiscovered { peer, address: to_addr });
                self.push(
                    to,
                    TransportEvent::AddressDiscovered {
                        peer: from_peer,
                        address: from_addr,
                    },
                );
            }
            TransportAction::Disconnect { peer } => {
                let to = self.index.get(&peer).copied();
                match to.filter(|to| self.links.remove(&link(from, *to))) {
                    Some(to) => {
                        self.push(from, TransportEvent::ConnectionClosed { peer });
                        self.push(to, TransportEvent::ConnectionClosed { peer: from_peer });
                    }
                    None => self.push(from, TransportEvent::ConnectionClosed { peer }),
                }
            }
            TransportAction::SendRequest {
                peer,
                request_id,
                request,
            } => {
                let to = self.index.get(&peer).copied().filter(|to| self.is_linked(from, *to));
                let Some(to) = to else {
                    self.push(
                        from,
                        TransportEvent::Response {
                            peer,
                            request_id,
                            result: Err(OutboundFailure::ConnectionClosed),
                        },
                    );
                    return;
                };
                let node = &self.nodes[to];
                if node.silenced || node.muted.contains(request.protocol()) {
                    trace!(node = to, protocol = request.protocol(), "sim: request swallowed");
                    return;
                }
                self.next_inbound += 1;
                let inbound = RequestId(self.next_inbound);
                self.pending.insert(
                    (to, inbound),
                    Pending {
                        requester: from,
                        request_id,
                        protocol: request.protocol().to_string(),
                    },
                );
                self.push(
                    to,
                    TransportEvent::InboundRequest {
                        peer: from_peer,
                        request_id: inbound,
                        request,
                    },
                );
            }
            TransportAction::SendResponse { request_id, response } => {
                let Some(pending) = self.pending.remove(&(from, request_id)) else {
                    return;
                };
                if !self.is_linked(from, pending.requester) {
                    return;
                }
                let response = match (response, self.nodes[from].tamper.as_mut()) {
                    (WireResponse::Response(bytes), Some(tamper)) => {
                        WireResponse::Response(tamper(&pending.protocol, bytes))
                    }
                    (response, _) => response,
                };
                self.push(
                    pending.requester,
                    TransportEvent::Response {
                        peer: from_peer,
                        request_id: pending.request_id,
                        result: Ok(response),
                    },
                );
            }
        }
    }
}
