//! The network worker: the single event loop owning all network state.
//!
//! The worker composes the [`PeerSet`], [`ReputationEngine`],
//! [`Multiplexer`], [`Dht`] and [`SyncCoordinator`]. It is driven by three
//! inputs, each taking the current time explicitly:
//!
//! - [`NetworkWorker::handle_command`] for requests from a [`NetworkService`]
//! - [`NetworkWorker::handle_transport_event`] for what happened on the wire
//! - [`NetworkWorker::tick`] for deadlines, decay and dialing
//!
//! Every input is followed by a pump that routes component outputs to each
//! other until all queues are empty. Wire work accumulates as
//! [`TransportAction`]s collected with [`NetworkWorker::drain_actions`];
//! [`NetworkWorker::run`] does all of this over a real [`Transport`].
//!
//! A tick runs, in order: multiplexer deadlines and notification flushing,
//! DHT deadlines, sync scheduling, reputation decay followed by
//! disconnecting banned peers, dial timeouts and new dials, and finally the
//! status snapshot.

use libp2p::{Multiaddr, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use weft_core::error::{BitswapError, DialError, RegistrationError, RequestFailure};
use weft_core::types::{BlockHeader, BlockNumber, Hash256};
use weft_core::{ChainBackend, SessionInfoProvider};

use crate::config::{parse_peer_addr, NetworkConfig};
use crate::dht::{Dht, DhtEvent, DhtOutput};
use crate::multiplexer::{
    IfDisconnected, InternalTag, Multiplexer, MuxOutput, NotificationSinks, ProtocolHandle, ProtocolKind,
    RequestOrigin,
};
use crate::network_state::{DhtState, KnownPeerState, NetworkState, NetworkStatus, PeerState};
use crate::peerset::{ConnectionState, DialCandidate, PeerInfo, PeerSet};
use crate::protocol::{
    decode_message, encode_message, BlockAnnounce, DhtRequest, ObservedRole, Status, WireResponse,
    BLOCKS_PROTOCOL, BLOCK_ANNOUNCES_PROTOCOL, BUILTIN_PROTOCOLS, KAD_PROTOCOL, STATUS_PROTOCOL,
};
use crate::reputation::{
    ReputationChange, ReputationEngine, ReputationOutcome, COST_BAD_MESSAGE, COST_DIAL_FAILURE,
    COST_GENESIS_MISMATCH, COST_RATE_LIMITED,
};
use crate::request_handlers::RequestHandlers;
use crate::service::{NetworkService, SharedState};
use crate::sync::{SyncAction, SyncCoordinator, SyncEvent, SyncMode};
use crate::transport::{Transport, TransportAction, TransportEvent};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A request from the service to the worker.
#[derive(Debug)]
pub enum Command {
    RegisterProtocol {
        name: String,
        kind: ProtocolKind,
        reply: oneshot::Sender<Result<ProtocolHandle, RegistrationError>>,
    },
    SendRequest {
        peer: PeerId,
        protocol: String,
        payload: Vec<u8>,
        /// `None` uses the configured default.
        timeout: Option<Duration>,
        if_disconnected: IfDisconnected,
        reply: oneshot::Sender<Result<Vec<u8>, RequestFailure>>,
    },
    GetValue {
        key: Vec<u8>,
        subscriber: mpsc::UnboundedSender<DhtEvent>,
    },
    PutValue {
        key: Vec<u8>,
        value: Vec<u8>,
        subscriber: mpsc::UnboundedSender<DhtEvent>,
    },
    Connect {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), DialError>>,
    },
    Disconnect {
        peer: PeerId,
    },
    ReportPeer {
        peer: PeerId,
        change: ReputationChange,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    NetworkState {
        reply: oneshot::Sender<NetworkState>,
    },
    AnnounceBlock {
        header: BlockHeader,
    },
    FetchContent {
        cid: Hash256,
        reply: oneshot::Sender<Result<Vec<u8>, BitswapError>>,
    },
    AddReservedPeer {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
    },
    RemoveReservedPeer {
        peer: PeerId,
    },
    Shutdown,
}

/// Published on [`NetworkService::event_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// Terminal event of a DHT lookup.
    Dht(DhtEvent),
    NotificationStreamOpened {
        peer: PeerId,
        protocol: String,
        role: ObservedRole,
    },
    NotificationStreamClosed {
        peer: PeerId,
        protocol: String,
    },
    SyncModeChanged(SyncMode),
    BlocksImported {
        best: BlockNumber,
        count: usize,
    },
    StateImported {
        number: BlockNumber,
    },
    WarpSyncAborted {
        attempt: u32,
        reason: String,
    },
    BlockAnnounced {
        peer: PeerId,
        header: BlockHeader,
    },
}

impl From<SyncEvent> for Event {
    fn from(event: SyncEvent) -> Self {
        match event {
            SyncEvent::ModeChanged(mode) => Event::SyncModeChanged(mode),
            SyncEvent::BlocksImported { best, count } => Event::BlocksImported { best, count },
            SyncEvent::StateImported { number } => Event::StateImported { number },
            SyncEvent::WarpSyncAborted { attempt, reason } => Event::WarpSyncAborted { attempt, reason },
        }
    }
}

pub struct NetworkWorker {
    config: NetworkConfig,
    local_peer_id: PeerId,
    chain: Arc<dyn ChainBackend>,
    peerset: PeerSet,
    reputation: ReputationEngine,
    mux: Multiplexer,
    dht: Dht,
    sync: SyncCoordinator,
    handlers: RequestHandlers,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<Event>,
    shared: Arc<SharedState>,
    content_waiters: HashMap<Hash256, Vec<oneshot::Sender<Result<Vec<u8>, BitswapError>>>>,
    listen_addresses: Vec<Multiaddr>,
    actions: Vec<TransportAction>,
    running: bool,
}

impl NetworkWorker {
    /// Build a worker and the service handle talking to it.
    pub fn new(
        config: NetworkConfig,
        local_peer_id: PeerId,
        chain: Arc<dyn ChainBackend>,
        sessions: Arc<dyn SessionInfoProvider>,
    ) -> (Self, NetworkService) {
        let required = vec![STATUS_PROTOCOL.to_string(), BLOCKS_PROTOCOL.to_string()];
        let mut peerset = PeerSet::new(local_peer_id, &config, required);
        let mut dht = Dht::new(local_peer_id, config.dht.clone());
        for addr in &config.reserved_peers {
            match parse_peer_addr(addr) {
                Some((peer, address)) => {
                    peerset.add_reserved(peer, std::slice::from_ref(&address));
                    dht.add_peer(peer, &[address]);
                }
                None => warn!(%addr, "network: ignoring invalid reserved peer address"),
            }
        }

        let sinks = NotificationSinks::default();
        let mux = Multiplexer::new(
            sinks.clone(),
            config.default_request_timeout(),
            config.notification_queue_size,
            config.handler_queue_size,
        );
        let sync = SyncCoordinator::new(config.sync.clone(), chain.clone(), sessions);
        let status = NetworkStatus::new(0, &BTreeMap::new(), sync.status());
        let shared = Arc::new(SharedState::new(status));
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let service = NetworkService::new(local_peer_id, command_tx, sinks, shared.clone(), events.clone());

        let worker = Self {
            handlers: RequestHandlers::new(chain.clone(), &config),
            reputation: ReputationEngine::new(config.reputation.clone()),
            config,
            local_peer_id,
            chain,
            peerset,
            mux,
            dht,
            sync,
            commands,
            events,
            shared,
            content_waiters: HashMap::new(),
            listen_addresses: Vec::new(),
            actions: Vec::new(),
            running: true,
        };
        (worker, service)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// `false` once a shutdown was requested.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync.mode()
    }

    /// Wire work produced since the last call.
    pub fn drain_actions(&mut self) -> Vec<TransportAction> {
        std::mem::take(&mut self.actions)
    }

    /// Handle every queued command without waiting.
    pub fn process_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command, now);
        }
    }

    /// Drive the worker over `transport` until shutdown.
    pub async fn run<T: Transport>(mut self, mut transport: T) {
        let period = self.config.tick_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(peer_id = %self.local_peer_id, "network: worker started");

        while self.running {
            tokio::select! {
                _ = ticker.tick() => self.tick(Instant::now()),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command, Instant::now()),
                    None => self.running = false,
                },
                event = transport.next_event() => match event {
                    Some(event) => self.handle_transport_event(event, Instant::now()),
                    None => {
                        warn!("network: transport closed");
                        self.running = false;
                    }
                },
            }
            for action in self.drain_actions() {
                transport.apply(action);
            }
        }

        self.shared.set_running(false);
        info!("network: worker stopped");
    }

    // ---- Commands ----

    pub fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::RegisterProtocol { name, kind, reply } => {
                let result = self.mux.register_protocol(&name, kind);
                if result.is_ok() {
                    self.on_protocols_changed(now);
                }
                let _ = reply.send(result);
            }
            Command::SendRequest {
                peer,
                protocol,
                payload,
                timeout,
                if_disconnected,
                reply,
            } => {
                if self.mux.sinks().kind(&protocol) != Some(ProtocolKind::RequestResponse) {
                    let _ = reply.send(Err(RequestFailure::UnknownProtocol));
                } else {
                    let timeout = timeout.unwrap_or_else(|| self.config.default_request_timeout());
                    let connected = self.peerset.is_connected(&peer);
                    self.mux.send_request(
                        peer,
                        &protocol,
                        payload,
                        RequestOrigin::External(reply),
                        timeout,
                        connected,
                        if_disconnected,
                        now,
                    );
                }
            }
            Command::GetValue { key, subscriber } => self.dht.get_value(key, subscriber, now),
            Command::PutValue { key, value, subscriber } => self.dht.put_value(key, value, subscriber, now),
            Command::Connect { peer, addresses, reply } => {
                let _ = reply.send(self.dial(peer, addresses, now));
            }
            Command::Disconnect { peer } => self.drop_peer(peer, "requested"),
            Command::ReportPeer { peer, change } => self.report(peer, change, now),
            Command::Peers { reply } => {
                let _ = reply.send(self.peerset.snapshot(&self.reputation));
            }
            Command::NetworkState { reply } => {
                let _ = reply.send(self.network_state(now));
            }
            Command::AnnounceBlock { header } => self.announce_block(header),
            Command::FetchContent { cid, reply } => {
                self.content_waiters.entry(cid).or_default().push(reply);
                self.sync.fetch_content(cid, now);
            }
            Command::AddReservedPeer { peer, addresses } => {
                self.peerset.add_reserved(peer, &addresses);
                self.dht.add_peer(peer, &addresses);
            }
            Command::RemoveReservedPeer { peer } => {
                if self.peerset.remove_reserved(&peer) {
                    self.drop_peer(peer, "no longer reserved");
                }
            }
            Command::Shutdown => {
                info!("network: shutdown requested");
                self.running = false;
            }
        }
        self.pump(now);
    }

    // ---- Transport ----

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionEstablished { peer, address, inbound } => {
                match self
                    .peerset
                    .on_connection_established(peer, address, inbound, &self.reputation, now)
                {
                    Ok(()) => self.on_peer_connected(peer, now),
                    Err(DialError::AlreadyConnected) => trace!(%peer, "network: extra connection ignored"),
                    Err(e) => {
                        debug!(%peer, error = %e, "network: connection refused");
                        self.actions.push(TransportAction::Disconnect { peer });
                    }
                }
                self.publish_status();
            }
            TransportEvent::ConnectionClosed { peer } => {
                self.on_peer_disconnected(peer, now);
                self.publish_status();
            }
            TransportEvent::DialFailure { peer, error } => {
                debug!(%peer, %error, "network: dial failed");
                self.peerset.on_dial_failure(&peer, now);
                self.report(peer, COST_DIAL_FAILURE, now);
                self.mux.on_dial_failure(&peer);
            }
            TransportEvent::InboundRequest {
                peer,
                request_id,
                request,
            } => self.mux.on_inbound_request(peer, request_id, request, now),
            TransportEvent::Response {
                peer,
                request_id,
                result,
            } => self.mux.on_response(peer, request_id, result, now),
            TransportEvent::AddressDiscovered { peer, address } => {
                if self.peerset.add_discovered(peer, std::slice::from_ref(&address), &self.reputation, now) {
                    trace!(%peer, %address, "network: address discovered");
                }
                self.dht.add_peer(peer, &[address]);
            }
            TransportEvent::NewListenAddr(address) => {
                info!(%address, "network: listening");
                if !self.listen_addresses.contains(&address) {
                    self.listen_addresses.push(address);
                    self.shared.set_listen_addresses(self.listen_addresses.clone());
                }
            }
        }
        self.pump(now);
    }

    fn on_peer_connected(&mut self, peer: PeerId, now: Instant) {
        let addresses = self.peerset.addresses(&peer);
        self.dht.add_peer(peer, &addresses);
        self.mux.on_connected(&peer);
        self.sync.on_peer_connected(peer);
        self.send_status(peer, now);
        self.publish(Event::PeerConnected(peer));
    }

    fn on_peer_disconnected(&mut self, peer: PeerId, now: Instant) {
        if self.peerset.on_connection_closed(&peer).is_none() {
            // A dial that never completed.
            self.mux.on_dial_failure(&peer);
            return;
        }
        let open = self.mux.open_protocols(&peer);
        self.mux.on_disconnected(&peer);
        self.pump(now);
        self.sync.on_peer_disconnected(&peer);
        self.handlers.remove_peer(&peer);
        self.reputation.forget(&peer);
        for protocol in open {
            self.publish(Event::NotificationStreamClosed { peer, protocol });
        }
        self.publish(Event::PeerDisconnected(peer));
    }

    // ---- Tick ----

    pub fn tick(&mut self, now: Instant) {
        self.mux.tick(now);
        self.dht.tick(now);
        self.sync.tick(now);
        self.pump(now);

        for peer in self.reputation.decay_tick(now) {
            debug!(%peer, "network: ban lifted");
        }
        for peer in self.peerset.connected_peers() {
            if self.reputation.is_banned(&peer, now) {
                self.drop_peer(peer, "banned");
            }
        }

        for peer in self.peerset.check_dial_timeouts(now) {
            debug!(%peer, "network: dial timed out");
            self.report(peer, COST_DIAL_FAILURE, now);
            self.mux.on_dial_failure(&peer);
        }
        for candidate in self.peerset.dial_candidates(&self.reputation, now) {
            let peer = candidate.peer_id;
            if let Err(e) = self.dial(peer, candidate.addresses, now) {
                trace!(%peer, error = %e, "network: candidate skipped");
            }
        }
        self.pump(now);
        self.publish_status();
    }

    // ---- Routing ----

    /// Route component outputs until every queue is empty.
    fn pump(&mut self, now: Instant) {
        loop {
            let sync = self.sync.drain_actions();
            let dht = self.dht.drain_outputs();
            let mux = self.mux.drain_outputs();
            if sync.is_empty() && dht.is_empty() && mux.is_empty() {
                break;
            }
            for action in sync {
                self.on_sync_action(action, now);
            }
            for output in dht {
                self.on_dht_output(output, now);
            }
            for output in mux {
                self.on_mux_output(output, now);
            }
        }
        self.actions.extend(self.mux.drain_actions());
    }

    fn on_sync_action(&mut self, action: SyncAction, now: Instant) {
        match action {
            SyncAction::Request { peer, phase, request } => match request.encode() {
                Ok(payload) => {
                    let connected = self.peerset.is_connected(&peer);
                    self.mux.send_request(
                        peer,
                        phase.protocol(),
                        payload,
                        RequestOrigin::Internal(InternalTag::Sync(phase)),
                        self.config.sync.request_timeout(),
                        connected,
                        IfDisconnected::ImmediateError,
                        now,
                    );
                }
                Err(e) => warn!(%peer, ?phase, error = %e, "network: sync request not encodable"),
            },
            SyncAction::Report { peer, change } => self.report(peer, change, now),
            SyncAction::Event(event) => self.publish(Event::from(event)),
            SyncAction::ContentFetched { cid, result } => {
                for waiter in self.content_waiters.remove(&cid).unwrap_or_default() {
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    fn on_dht_output(&mut self, output: DhtOutput, now: Instant) {
        match output {
            DhtOutput::Request { peer, query, request } => match encode_message(&request) {
                Ok(payload) => {
                    let connected = self.peerset.is_connected(&peer);
                    let timeout = self.config.default_request_timeout().min(self.config.dht.query_timeout());
                    self.mux.send_request(
                        peer,
                        KAD_PROTOCOL,
                        payload,
                        RequestOrigin::Internal(InternalTag::Dht { query }),
                        timeout,
                        connected,
                        IfDisconnected::TryConnect,
                        now,
                    );
                }
                Err(e) => {
                    warn!(%peer, error = %e, "network: dht request not encodable");
                    self.dht.on_response(peer, query, Err(RequestFailure::Refused));
                }
            },
            DhtOutput::Discovered { peer, addresses } => {
                self.peerset.add_discovered(peer, &addresses, &self.reputation, now);
            }
            DhtOutput::Report { peer, change } => self.report(peer, change, now),
            DhtOutput::Event(event) => self.publish(Event::Dht(event)),
        }
    }

    fn on_mux_output(&mut self, output: MuxOutput, now: Instant) {
        match output {
            MuxOutput::Response { peer, tag, result } => match tag {
                InternalTag::Status => match result {
                    Ok(bytes) => match decode_message::<Status>(&bytes) {
                        Some(status) => {
                            self.on_status(peer, status, now);
                        }
                        None => self.report(peer, COST_BAD_MESSAGE, now),
                    },
                    Err(e) => debug!(%peer, error = %e, "network: status request failed"),
                },
                InternalTag::Sync(phase) => self.sync.on_response(peer, phase, result, now),
                InternalTag::Dht { query } => self.dht.on_response(peer, query, result),
                InternalTag::Notifications => {}
            },
            MuxOutput::BuiltinRequest {
                peer,
                request_id,
                protocol,
                payload,
            } => {
                let response = self.serve_builtin(peer, &protocol, &payload, now);
                self.mux.respond(request_id, &protocol, response);
            }
            MuxOutput::BuiltinNotification { peer, protocol, payload } => {
                if protocol == BLOCK_ANNOUNCES_PROTOCOL {
                    self.on_block_announce(peer, &payload, now);
                }
            }
            MuxOutput::Dial { peer } => match self.dial(peer, Vec::new(), now) {
                Ok(()) | Err(DialError::AlreadyConnected) => {}
                Err(e) => {
                    debug!(%peer, error = %e, "network: cannot dial for parked request");
                    self.mux.on_dial_failure(&peer);
                }
            },
            MuxOutput::Report { peer, change } => self.report(peer, change, now),
        }
    }

    // ---- Handshake and built-in protocols ----

    fn local_protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = BUILTIN_PROTOCOLS.iter().map(|p| p.to_string()).collect();
        protocols.extend(self.mux.registered_protocols());
        protocols
    }

    fn local_status(&self) -> Status {
        let best = self.chain.best_header();
        let finalized = self.chain.finalized_header();
        Status {
            genesis_hash: self.chain.genesis_hash(),
            role: self.config.role,
            best_number: best.number,
            best_hash: best.hash(),
            finalized_number: finalized.number,
            finalized_hash: finalized.hash(),
            protocols: self.local_protocols(),
        }
    }

    fn send_status(&mut self, peer: PeerId, now: Instant) {
        match encode_message(&self.local_status()) {
            Ok(payload) => {
                self.mux.send_request(
                    peer,
                    STATUS_PROTOCOL,
                    payload,
                    RequestOrigin::Internal(InternalTag::Status),
                    self.config.default_request_timeout(),
                    true,
                    IfDisconnected::ImmediateError,
                    now,
                );
            }
            Err(e) => warn!(%peer, error = %e, "network: status not encodable"),
        }
    }

    /// Apply a peer's status. Returns `false` if the peer was rejected.
    fn on_status(&mut self, peer: PeerId, status: Status, now: Instant) -> bool {
        if !self.peerset.is_connected(&peer) {
            return false;
        }
        if status.genesis_hash != self.chain.genesis_hash() {
            warn!(%peer, theirs = %status.genesis_hash.short(), "network: genesis mismatch");
            self.report(peer, COST_GENESIS_MISMATCH, now);
            self.drop_peer(peer, "genesis mismatch");
            return false;
        }
        self.peerset
            .set_status(&peer, status.role, status.protocols.clone(), status.best_number);
        self.sync.on_peer_status(peer, &status, now);
        for protocol in self.mux.open_notifications(peer, status.role, &status.protocols) {
            self.publish(Event::NotificationStreamOpened {
                peer,
                protocol,
                role: status.role,
            });
        }
        true
    }

    /// A protocol was registered: re-advertise and open new streams towards
    /// peers that already support it.
    fn on_protocols_changed(&mut self, now: Instant) {
        for info in self.peerset.snapshot(&self.reputation) {
            if info.state != ConnectionState::Connected {
                continue;
            }
            self.send_status(info.peer_id, now);
            if let Some(role) = info.role {
                for protocol in self.mux.open_notifications(info.peer_id, role, &info.protocols) {
                    self.publish(Event::NotificationStreamOpened {
                        peer: info.peer_id,
                        protocol,
                        role,
                    });
                }
            }
        }
    }

    fn serve_builtin(&mut self, peer: PeerId, protocol: &str, payload: &[u8], now: Instant) -> WireResponse {
        match protocol {
            STATUS_PROTOCOL => match decode_message::<Status>(payload) {
                Some(status) if self.on_status(peer, status.clone(), now) => encode_response(&self.local_status()),
                Some(_) => WireResponse::Refused,
                None => {
                    self.report(peer, COST_BAD_MESSAGE, now);
                    WireResponse::Refused
                }
            },
            KAD_PROTOCOL => {
                if !self.handlers.admit(&peer, KAD_PROTOCOL, now) {
                    self.report(peer, COST_RATE_LIMITED, now);
                    return WireResponse::Refused;
                }
                match decode_message::<DhtRequest>(payload) {
                    Some(request) => encode_response(&self.dht.handle_request(&peer, request, now)),
                    None => {
                        self.report(peer, COST_BAD_MESSAGE, now);
                        WireResponse::Refused
                    }
                }
            }
            _ => {
                let outcome = self.handlers.handle(&peer, protocol, payload, now);
                if let Some(change) = outcome.report {
                    self.report(peer, change, now);
                }
                outcome.response
            }
        }
    }

    fn on_block_announce(&mut self, peer: PeerId, payload: &[u8], now: Instant) {
        let Some(BlockAnnounce { header }) = decode_message(payload) else {
            self.report(peer, COST_BAD_MESSAGE, now);
            return;
        };
        trace!(%peer, number = header.number, "network: block announced");
        self.peerset.set_best(&peer, header.number);
        self.sync.on_block_announce(peer, &header, now);
        self.publish(Event::BlockAnnounced { peer, header });
    }

    fn announce_block(&mut self, header: BlockHeader) {
        let number = header.number;
        let payload = match encode_message(&BlockAnnounce { header }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(number, error = %e, "network: announcement not encodable");
                return;
            }
        };
        let sinks = self.mux.sinks();
        for peer in self.peerset.connected_peers() {
            let queued = sinks
                .sender(&peer, BLOCK_ANNOUNCES_PROTOCOL)
                .and_then(|sender| sender.reserve())
                .and_then(|slot| slot.send(payload.clone()));
            if let Err(e) = queued {
                debug!(%peer, number, error = %e, "network: announcement not queued");
            }
        }
    }

    // ---- Peers ----

    fn dial(&mut self, peer: PeerId, addresses: Vec<Multiaddr>, now: Instant) -> Result<(), DialError> {
        let candidate = DialCandidate {
            peer_id: peer,
            addresses,
        };
        let peer = self.peerset.connect(candidate, &self.reputation, now)?;
        self.actions.push(TransportAction::Dial {
            peer,
            addresses: self.peerset.addresses(&peer),
        });
        Ok(())
    }

    /// Close the connection to `peer`. Sync stops using it right away.
    fn drop_peer(&mut self, peer: PeerId, reason: &str) {
        if self.peerset.state(&peer) == Some(ConnectionState::Disconnecting) {
            return;
        }
        if self.peerset.disconnect(&peer, reason) {
            self.actions.push(TransportAction::Disconnect { peer });
        }
        self.sync.on_peer_disconnected(&peer);
    }

    /// Apply a reputation change; a ban disconnects immediately.
    fn report(&mut self, peer: PeerId, change: ReputationChange, now: Instant) {
        if let ReputationOutcome::Banned { score } = self.reputation.apply(&peer, change, now) {
            info!(%peer, score, reason = change.reason, "network: dropping banned peer");
            self.drop_peer(peer, change.reason);
        }
    }

    // ---- Snapshots ----

    fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        let status = NetworkStatus::new(self.peerset.num_connected(), &self.mux.traffic(), self.sync.status());
        self.shared.set_status(status);
    }

    fn network_state(&self, now: Instant) -> NetworkState {
        let connected_peers = self
            .peerset
            .snapshot(&self.reputation)
            .iter()
            .map(|info| PeerState::new(info, self.mux.open_protocols(&info.peer_id)))
            .collect();
        let not_connected_peers = self
            .peerset
            .known_not_connected()
            .iter()
            .map(|(peer, known)| KnownPeerState::new(peer, known, self.reputation.score(peer)))
            .collect();
        let mut banned_peers: Vec<String> = self
            .reputation
            .banned_peers(now)
            .iter()
            .map(ToString::to_string)
            .collect();
        banned_peers.sort();

        NetworkState {
            local_peer_id: self.local_peer_id.to_string(),
            listen_addresses: self.listen_addresses.iter().map(ToString::to_string).collect(),
            connected_peers,
            not_connected_peers,
            banned_peers,
            registered_protocols: self.mux.registered_protocols(),
            traffic: self.mux.traffic(),
            dht: DhtState {
                routing_table_size: self.dht.routing_table_size(),
                records: self.dht.record_count(),
                active_queries: self.dht.active_queries(),
            },
            sync: self.sync.status(),
        }
    }
}

fn encode_response<T: bincode::Encode>(msg: &T) -> WireResponse {
    match encode_message(msg) {
        Ok(bytes) => WireResponse::Response(bytes),
        Err(e) => {
            warn!(error = %e, "network: response not encodable");
            WireResponse::Refused
        }
    }
}

#[cfg(test)]
mod tests;
