//! Cloneable handle to a running [`NetworkWorker`](crate::worker::NetworkWorker).
//!
//! Every mutating call is a [`Command`] on an unbounded queue. The command
//! is enqueued when the method is called; the returned future only waits for
//! the worker's answer, so dropping it never loses the command. Status,
//! listen addresses and notification senders are read from shared state
//! without a round trip.

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use weft_core::error::{
    BitswapError, DialError, NetworkError, NotificationError, RegistrationError, RequestFailure, WeftError,
};
use weft_core::types::{BlockHeader, Hash256};

use crate::dht::DhtSubscription;
use crate::multiplexer::{
    IfDisconnected, NotificationSender, NotificationSenderReady, NotificationSinks, ProtocolHandle, ProtocolKind,
};
use crate::network_state::{NetworkState, NetworkStatus};
use crate::peerset::PeerInfo;
use crate::reputation::ReputationChange;
use crate::worker::{Command, Event};

/// State the worker publishes for lock-free-ish reads by the service.
pub struct SharedState {
    status: RwLock<NetworkStatus>,
    listen_addresses: RwLock<Vec<Multiaddr>>,
    running: AtomicBool,
}

impl SharedState {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: RwLock::new(status),
            listen_addresses: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: NetworkStatus) {
        *self.status.write() = status;
    }

    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen_addresses.read().clone()
    }

    pub fn set_listen_addresses(&self, addresses: Vec<Multiaddr>) {
        *self.listen_addresses.write() = addresses;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

/// The worker's answer to a command.
///
/// Resolves to [`NetworkError::WorkerStopped`] if the worker went away
/// before answering.
#[must_use = "the command is already sent; await the reply to observe its outcome"]
pub struct Reply<T> {
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Reply<T> {
    fn stopped() -> Self {
        Self { rx: None }
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T, NetworkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Err(NetworkError::WorkerStopped)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.map_err(|_| NetworkError::WorkerStopped)),
        }
    }
}

/// Identity and addresses of the local node.
pub trait NetworkStateInfo {
    fn local_peer_id(&self) -> PeerId;
    fn listen_addresses(&self) -> Vec<Multiaddr>;
}

#[derive(Clone)]
pub struct NetworkService {
    local_peer_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    sinks: NotificationSinks,
    shared: Arc<SharedState>,
    events: broadcast::Sender<Event>,
}

impl NetworkService {
    pub(crate) fn new(
        local_peer_id: PeerId,
        commands: mpsc::UnboundedSender<Command>,
        sinks: NotificationSinks,
        shared: Arc<SharedState>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            local_peer_id,
            commands,
            sinks,
            shared,
            events,
        }
    }

    fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Reply<T> {
        let (tx, rx) = oneshot::channel();
        if self.send(make(tx)) {
            Reply { rx: Some(rx) }
        } else {
            Reply::stopped()
        }
    }

    // ---- Protocols ----

    /// Register an application protocol. Incoming traffic arrives on the
    /// returned handle; peers learn about the protocol through a fresh
    /// status exchange.
    pub fn register_protocol(
        &self,
        name: &str,
        kind: ProtocolKind,
    ) -> impl Future<Output = Result<ProtocolHandle, WeftError>> + use<> {
        let reply = self.call(|reply| Command::RegisterProtocol {
            name: name.to_string(),
            kind,
            reply,
        });
        async move {
            let registered: Result<ProtocolHandle, RegistrationError> = reply.await?;
            Ok(registered.map_err(NetworkError::from)?)
        }
    }

    /// Sender for an open notification stream towards `peer`.
    pub fn notification_sender(&self, peer: &PeerId, protocol: &str) -> Result<NotificationSender, NotificationError> {
        self.sinks.sender(peer, protocol)
    }

    /// First phase of a two-phase send: reserve a queue slot.
    ///
    /// Waits for capacity. Fails with [`NotificationError::NotConnected`] if
    /// the stream is closed while waiting.
    pub async fn reserve_send(&self, peer: &PeerId, protocol: &str) -> Result<NotificationSenderReady, NotificationError> {
        self.sinks.sender(peer, protocol)?.ready().await
    }

    /// Send a request on a registered request/response protocol.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub fn send_request(
        &self,
        peer: PeerId,
        protocol: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        if_disconnected: IfDisconnected,
    ) -> impl Future<Output = Result<Vec<u8>, RequestFailure>> + use<> {
        let reply = self.call(|reply| Command::SendRequest {
            peer,
            protocol: protocol.to_string(),
            payload,
            timeout,
            if_disconnected,
            reply,
        });
        async move { reply.await.unwrap_or(Err(RequestFailure::NotConnected)) }
    }

    // ---- DHT ----

    /// Look up `key`. The subscription yields exactly one terminal event.
    pub fn get_value(&self, key: Vec<u8>) -> Result<DhtSubscription, NetworkError> {
        let (subscriber, subscription) = DhtSubscription::channel();
        if !self.send(Command::GetValue { key, subscriber }) {
            return Err(NetworkError::WorkerStopped);
        }
        Ok(subscription)
    }

    /// Store `value` under `key` locally and on the closest peers.
    pub fn put_value(&self, key: Vec<u8>, value: Vec<u8>) -> Result<DhtSubscription, NetworkError> {
        let (subscriber, subscription) = DhtSubscription::channel();
        if !self.send(Command::PutValue { key, value, subscriber }) {
            return Err(NetworkError::WorkerStopped);
        }
        Ok(subscription)
    }

    // ---- Peers ----

    /// Dial `peer`, adding `addresses` to its known addresses. Resolves once
    /// the dial is accepted, not when the connection is up.
    pub fn connect(
        &self,
        peer: PeerId,
        addresses: Vec<Multiaddr>,
    ) -> impl Future<Output = Result<(), WeftError>> + use<> {
        let reply = self.call(|reply| Command::Connect { peer, addresses, reply });
        async move {
            let accepted: Result<(), DialError> = reply.await?;
            accepted.map_err(|e| WeftError::Network(NetworkError::Dial(e)))
        }
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.send(Command::Disconnect { peer });
    }

    /// Adjust `peer`'s reputation. Crossing the ban threshold disconnects it.
    pub fn report_peer(&self, peer: PeerId, change: ReputationChange) {
        self.send(Command::ReportPeer { peer, change });
    }

    pub fn add_reserved_peer(&self, peer: PeerId, addresses: Vec<Multiaddr>) {
        self.send(Command::AddReservedPeer { peer, addresses });
    }

    pub fn remove_reserved_peer(&self, peer: PeerId) {
        self.send(Command::RemoveReservedPeer { peer });
    }

    /// Snapshot of every peer holding a connection slot.
    pub fn peers(&self) -> Reply<Vec<PeerInfo>> {
        self.call(|reply| Command::Peers { reply })
    }

    // ---- Chain ----

    /// Announce a new local block to every connected peer.
    pub fn announce_block(&self, header: BlockHeader) {
        self.send(Command::AnnounceBlock { header });
    }

    /// Fetch content-addressed data from peers.
    pub fn fetch_content(&self, cid: Hash256) -> impl Future<Output = Result<Vec<u8>, WeftError>> + use<> {
        let reply = self.call(|reply| Command::FetchContent { cid, reply });
        async move {
            let fetched: Result<Vec<u8>, BitswapError> = reply.await?;
            Ok(fetched?)
        }
    }

    // ---- Introspection ----

    /// Latest status snapshot, refreshed by the worker every tick.
    pub fn status(&self) -> NetworkStatus {
        self.shared.status()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.status().num_connected_peers
    }

    /// Full diagnostic dump.
    pub fn network_state(&self) -> Reply<NetworkState> {
        self.call(|reply| Command::NetworkState { reply })
    }

    /// Subscribe to network events. Slow subscribers miss events rather
    /// than slow down the worker.
    pub fn event_stream(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running() && !self.commands.is_closed()
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }
}

impl NetworkStateInfo for NetworkService {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.shared.listen_addresses()
    }
}
