//! Protocol multiplexer.
//!
//! Every runtime protocol, built in or registered by the embedder, travels
//! over the single [`MUX_PROTOCOL`] request-response protocol wrapped in a
//! [`WireRequest`] envelope that names it. The multiplexer owns everything
//! keyed by (peer, protocol):
//!
//! - at most one outbound request slot; a newer request supersedes the old
//!   one, which resolves as [`RequestFailure::Obsolete`]
//! - bounded outbound notification queues, drained stop-and-wait: one batch
//!   in flight, the next batch only after the remote acknowledged it, so
//!   notifications arrive in order
//! - inbound requests awaiting a handler's answer, each with a deadline
//! - traffic counters per protocol
//!
//! Outputs are queued and drained by the worker: wire actions through
//! [`Multiplexer::drain_actions`], everything needing worker attention
//! through [`Multiplexer::drain_outputs`].

use libp2p::PeerId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use weft_core::error::{NotificationError, OutboundFailure, RegistrationError, RequestFailure};

use crate::dht::QueryId;
use crate::protocol::{
    is_builtin, ObservedRole, WireRequest, WireResponse, BLOCK_ANNOUNCES_PROTOCOL, MAX_REQUEST_SIZE,
};
use crate::reputation::ReputationChange;
use crate::sync::SyncPhase;
use crate::transport::{RequestId, TransportAction};

/// Payloads per notification batch.
pub const MAX_NOTIFICATION_BATCH: usize = 64;
const MAX_BATCH_BYTES: usize = MAX_REQUEST_SIZE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolKind {
    Notification,
    RequestResponse,
}

/// What to do with a request for a peer that is not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfDisconnected {
    /// Dial the peer and send once connected.
    TryConnect,
    ImmediateError,
}

/// Delivered to the handler of a notification protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// Both sides support the protocol; sending is possible.
    Opened { peer: PeerId, role: ObservedRole },
    Received { peer: PeerId, payload: Vec<u8> },
    Closed { peer: PeerId },
}

/// An inbound request for a registered request-response protocol.
///
/// Dropping `pending_response` (or not answering within the request
/// timeout) refuses the request.
#[derive(Debug)]
pub struct IncomingRequest {
    pub peer: PeerId,
    pub payload: Vec<u8>,
    pub pending_response: oneshot::Sender<OutgoingResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResponse {
    /// `Err(())` refuses the request.
    pub result: Result<Vec<u8>, ()>,
    /// Applied to the requesting peer.
    pub reputation_changes: Vec<ReputationChange>,
}

/// Receiving side handed out by protocol registration.
#[derive(Debug)]
pub enum ProtocolHandle {
    Notifications(mpsc::Receiver<NotificationEvent>),
    Requests(mpsc::Receiver<IncomingRequest>),
}

/// Who is waiting for an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTag {
    Status,
    Sync(SyncPhase),
    Dht { query: QueryId },
    /// A notification batch awaiting its ack.
    Notifications,
}

#[derive(Debug)]
pub enum RequestOrigin {
    External(oneshot::Sender<Result<Vec<u8>, RequestFailure>>),
    Internal(InternalTag),
}

/// Worker-facing output of the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxOutput {
    /// Outcome of an internally originated request.
    Response { peer: PeerId, tag: InternalTag, result: Result<Vec<u8>, RequestFailure> },
    /// Inbound request on a built-in protocol; answer with [`Multiplexer::respond`].
    BuiltinRequest { peer: PeerId, request_id: RequestId, protocol: String, payload: Vec<u8> },
    /// Inbound notification on a built-in protocol.
    BuiltinNotification { peer: PeerId, protocol: String, payload: Vec<u8> },
    /// A request is parked until `peer` connects.
    Dial { peer: PeerId },
    Report { peer: PeerId, change: ReputationChange },
}

/// Per-protocol traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolTraffic {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

struct SinkEntry {
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

/// Shared view of open notification sinks and registered protocol kinds.
///
/// Cloned into the service handle so senders can be obtained without a
/// round trip through the worker.
#[derive(Clone, Default)]
pub struct NotificationSinks {
    sinks: Arc<RwLock<HashMap<(PeerId, String), SinkEntry>>>,
    kinds: Arc<RwLock<HashMap<String, ProtocolKind>>>,
}

impl NotificationSinks {
    /// Sender for `protocol` towards `peer`.
    pub fn sender(&self, peer: &PeerId, protocol: &str) -> Result<NotificationSender, NotificationError> {
        match self.kind(protocol) {
            None => return Err(NotificationError::UnknownProtocol),
            Some(ProtocolKind::RequestResponse) => return Err(NotificationError::WrongKind),
            Some(ProtocolKind::Notification) => {}
        }
        let sinks = self.sinks.read();
        let entry = sinks
            .get(&(*peer, protocol.to_string()))
            .ok_or(NotificationError::NotConnected)?;
        Ok(NotificationSender {
            peer: *peer,
            protocol: protocol.to_string(),
            tx: entry.tx.clone(),
            connected: entry.connected.clone(),
        })
    }

    pub fn kind(&self, protocol: &str) -> Option<ProtocolKind> {
        self.kinds.read().get(protocol).copied()
    }

    pub fn is_open(&self, peer: &PeerId, protocol: &str) -> bool {
        self.sinks.read().contains_key(&(*peer, protocol.to_string()))
    }

    fn open(&self, peer: PeerId, protocol: &str, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let entry = SinkEntry {
            tx,
            connected: Arc::new(AtomicBool::new(true)),
        };
        if let Some(old) = self.sinks.write().insert((peer, protocol.to_string()), entry) {
            old.connected.store(false, Ordering::SeqCst);
        }
        rx
    }

    fn close(&self, peer: &PeerId, protocol: &str) {
        if let Some(entry) = self.sinks.write().remove(&(*peer, protocol.to_string())) {
            entry.connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Handle for pushing notifications to one peer on one protocol.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    peer: PeerId,
    protocol: String,
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl NotificationSender {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Reserve a queue slot without waiting.
    pub fn reserve(&self) -> Result<NotificationSenderReady, NotificationError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NotificationError::NotConnected);
        }
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(NotificationSenderReady {
                permit,
                connected: self.connected.clone(),
            }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NotificationError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NotificationError::NotConnected),
        }
    }

    /// Wait for a queue slot.
    pub async fn ready(&self) -> Result<NotificationSenderReady, NotificationError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NotificationError::NotConnected);
        }
        let permit = self
            .tx
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| NotificationError::NotConnected)?;
        Ok(NotificationSenderReady {
            permit,
            connected: self.connected.clone(),
        })
    }
}

/// A reserved slot in a notification queue.
#[derive(Debug)]
pub struct NotificationSenderReady {
    permit: mpsc::OwnedPermit<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl NotificationSenderReady {
    /// Enqueue `payload`. Fails if the peer disconnected since the
    /// reservation, releasing the slot.
    pub fn send(self, payload: Vec<u8>) -> Result<(), NotificationError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NotificationError::NotConnected);
        }
        self.permit.send(payload);
        Ok(())
    }
}

enum HandlerTx {
    Notifications(mpsc::Sender<NotificationEvent>),
    Requests(mpsc::Sender<IncomingRequest>),
}

struct PendingRequest {
    peer: PeerId,
    protocol: String,
    origin: RequestOrigin,
    deadline: Instant,
    /// Held until the peer connects.
    parked: Option<WireRequest>,
}

struct InboundPending {
    peer: PeerId,
    protocol: String,
    request_id: RequestId,
    rx: oneshot::Receiver<OutgoingResponse>,
    deadline: Instant,
}

struct OutboundQueue {
    rx: mpsc::Receiver<Vec<u8>>,
    in_flight: Option<RequestId>,
    /// Payload that did not fit into the previous batch.
    held: Option<Vec<u8>>,
}

pub struct Multiplexer {
    next_request_id: u64,
    inbound_timeout: Duration,
    queue_size: usize,
    handler_queue_size: usize,
    handlers: HashMap<String, HandlerTx>,
    sinks: NotificationSinks,
    slots: HashMap<(PeerId, String), RequestId>,
    pending: HashMap<RequestId, PendingRequest>,
    inbound: Vec<InboundPending>,
    queues: HashMap<(PeerId, String), OutboundQueue>,
    traffic: BTreeMap<String, ProtocolTraffic>,
    actions: Vec<TransportAction>,
    outputs: Vec<MuxOutput>,
}

impl Multiplexer {
    pub fn new(
        sinks: NotificationSinks,
        inbound_timeout: Duration,
        queue_size: usize,
        handler_queue_size: usize,
    ) -> Self {
        sinks
            .kinds
            .write()
            .insert(BLOCK_ANNOUNCES_PROTOCOL.to_string(), ProtocolKind::Notification);
        Self {
            next_request_id: 0,
            inbound_timeout,
            queue_size,
            handler_queue_size,
            handlers: HashMap::new(),
            sinks,
            slots: HashMap::new(),
            pending: HashMap::new(),
            inbound: Vec::new(),
            queues: HashMap::new(),
            traffic: BTreeMap::new(),
            actions: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn sinks(&self) -> &NotificationSinks {
        &self.sinks
    }

    /// Register an embedder protocol.
    pub fn register_protocol(&mut self, name: &str, kind: ProtocolKind) -> Result<ProtocolHandle, RegistrationError> {
        if !name.starts_with('/') || name.len() < 2 || name.chars().any(char::is_whitespace) {
            return Err(RegistrationError::InvalidName(name.to_string()));
        }
        if is_builtin(name) || self.handlers.contains_key(name) {
            return Err(RegistrationError::AlreadyRegistered(name.to_string()));
        }

        let (handle, tx) = match kind {
            ProtocolKind::Notification => {
                let (tx, rx) = mpsc::channel(self.handler_queue_size.max(1));
                (ProtocolHandle::Notifications(rx), HandlerTx::Notifications(tx))
            }
            ProtocolKind::RequestResponse => {
                let (tx, rx) = mpsc::channel(self.handler_queue_size.max(1));
                (ProtocolHandle::Requests(rx), HandlerTx::Requests(tx))
            }
        };
        self.handlers.insert(name.to_string(), tx);
        self.sinks.kinds.write().insert(name.to_string(), kind);
        debug!(protocol = name, ?kind, "mux: protocol registered");
        Ok(handle)
    }

    /// Registered embedder protocols, sorted.
    pub fn registered_protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn allocate_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        RequestId(self.next_request_id)
    }

    fn count_out(&mut self, protocol: &str, bytes: usize) {
        let entry = self.traffic.entry(protocol.to_string()).or_default();
        entry.bytes_out += bytes as u64;
        entry.messages_out += 1;
    }

    fn count_in(&mut self, protocol: &str, bytes: usize) {
        let entry = self.traffic.entry(protocol.to_string()).or_default();
        entry.bytes_in += bytes as u64;
        entry.messages_in += 1;
    }

    fn resolve(&mut self, peer: PeerId, origin: RequestOrigin, result: Result<Vec<u8>, RequestFailure>) {
        match origin {
            RequestOrigin::External(tx) => {
                let _ = tx.send(result);
            }
            RequestOrigin::Internal(tag) => self.outputs.push(MuxOutput::Response { peer, tag, result }),
        }
    }

    /// Queue a request for `peer` on `protocol`.
    ///
    /// Supersedes any request already occupying the (peer, protocol) slot.
    /// Returns the id, or `None` when the request failed immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &mut self,
        peer: PeerId,
        protocol: &str,
        payload: Vec<u8>,
        origin: RequestOrigin,
        timeout: Duration,
        connected: bool,
        if_disconnected: IfDisconnected,
        now: Instant,
    ) -> Option<RequestId> {
        if !connected && if_disconnected == IfDisconnected::ImmediateError {
            self.resolve(peer, origin, Err(RequestFailure::NotConnected));
            return None;
        }

        let key = (peer, protocol.to_string());
        if let Some(old) = self.slots.remove(&key) {
            if let Some(superseded) = self.pending.remove(&old) {
                debug!(%peer, protocol, id = %old, "mux: request superseded");
                self.resolve(peer, superseded.origin, Err(RequestFailure::Obsolete));
            }
        }

        let id = self.allocate_id();
        let request = WireRequest::Request {
            protocol: protocol.to_string(),
            payload,
        };
        let parked = if connected {
            self.count_out(protocol, request.payload_len());
            self.actions.push(TransportAction::SendRequest {
                peer,
                request_id: id,
                request,
            });
            None
        } else {
            self.outputs.push(MuxOutput::Dial { peer });
            Some(request)
        };
        self.slots.insert(key, id);
        self.pending.insert(
            id,
            PendingRequest {
                peer,
                protocol: protocol.to_string(),
                origin,
                deadline: now + timeout,
                parked,
            },
        );
        trace!(%peer, protocol, %id, connected, "mux: request queued");
        Some(id)
    }

    /// Outcome of an outbound request arrived. Late or unknown ids are ignored.
    pub fn on_response(
        &mut self,
        peer: PeerId,
        request_id: RequestId,
        result: Result<WireResponse, OutboundFailure>,
        now: Instant,
    ) {
        let Some(pending) = self.pending.remove(&request_id) else {
            trace!(%peer, id = %request_id, "mux: ignoring late response");
            return;
        };
        let key = (pending.peer, pending.protocol.clone());
        if self.slots.get(&key) == Some(&request_id) {
            self.slots.remove(&key);
        }
        if let Ok(response) = &result {
            self.count_in(&pending.protocol, response.payload_len());
        }

        if let RequestOrigin::Internal(InternalTag::Notifications) = pending.origin {
            if let Some(queue) = self.queues.get_mut(&key) {
                queue.in_flight = None;
            }
            match result {
                Ok(WireResponse::Ack) => self.drain_queue(&key, now),
                other => debug!(%peer, protocol = %pending.protocol, ?other, "mux: notification batch not acknowledged"),
            }
            return;
        }

        let result = match result {
            Ok(WireResponse::Response(payload)) => Ok(payload),
            Ok(WireResponse::Refused) => Err(RequestFailure::Refused),
            Ok(WireResponse::UnknownProtocol) => Err(RequestFailure::UnknownProtocol),
            Ok(WireResponse::Ack) => Ok(Vec::new()),
            Err(failure) => Err(RequestFailure::Network(failure)),
        };
        self.resolve(peer, pending.origin, result);
    }

    /// Dispatch an inbound request.
    pub fn on_inbound_request(&mut self, peer: PeerId, request_id: RequestId, request: WireRequest, now: Instant) {
        let protocol = request.protocol().to_string();
        match request {
            WireRequest::Notifications { payloads, .. } => {
                for payload in &payloads {
                    self.count_in(&protocol, payload.len());
                }
                let response = self.deliver_notifications(peer, &protocol, payloads);
                self.respond(request_id, &protocol, response);
            }
            WireRequest::Request { payload, .. } => {
                self.count_in(&protocol, payload.len());
                if is_builtin(&protocol) {
                    self.outputs.push(MuxOutput::BuiltinRequest {
                        peer,
                        request_id,
                        protocol,
                        payload,
                    });
                    return;
                }
                let Some(HandlerTx::Requests(tx)) = self.handlers.get(&protocol) else {
                    self.respond(request_id, &protocol, WireResponse::UnknownProtocol);
                    return;
                };
                let (response_tx, rx) = oneshot::channel();
                let incoming = IncomingRequest {
                    peer,
                    payload,
                    pending_response: response_tx,
                };
                if tx.try_send(incoming).is_err() {
                    warn!(%peer, protocol, "mux: handler queue full, refusing request");
                    self.respond(request_id, &protocol, WireResponse::Refused);
                    return;
                }
                self.inbound.push(InboundPending {
                    peer,
                    protocol,
                    request_id,
                    rx,
                    deadline: now + self.inbound_timeout,
                });
            }
        }
    }

    fn deliver_notifications(&mut self, peer: PeerId, protocol: &str, payloads: Vec<Vec<u8>>) -> WireResponse {
        if protocol == BLOCK_ANNOUNCES_PROTOCOL {
            for payload in payloads {
                self.outputs.push(MuxOutput::BuiltinNotification {
                    peer,
                    protocol: protocol.to_string(),
                    payload,
                });
            }
            return WireResponse::Ack;
        }
        let Some(HandlerTx::Notifications(tx)) = self.handlers.get(protocol) else {
            return WireResponse::UnknownProtocol;
        };
        if !self.sinks.is_open(&peer, protocol) {
            return WireResponse::Refused;
        }
        for payload in payloads {
            if tx.try_send(NotificationEvent::Received { peer, payload }).is_err() {
                warn!(%peer, protocol, "mux: notification handler lagging, dropping message");
            }
        }
        WireResponse::Ack
    }

    /// Answer an inbound request.
    pub fn respond(&mut self, request_id: RequestId, protocol: &str, response: WireResponse) {
        self.count_out(protocol, response.payload_len());
        self.actions.push(TransportAction::SendResponse { request_id, response });
    }

    /// Send requests that were waiting for `peer` to connect.
    pub fn on_connected(&mut self, peer: &PeerId) {
        let mut ready: Vec<(RequestId, WireRequest)> = self
            .pending
            .iter_mut()
            .filter(|(_, p)| p.peer == *peer)
            .filter_map(|(id, p)| p.parked.take().map(|request| (*id, request)))
            .collect();
        ready.sort_by_key(|(id, _)| *id);
        for (request_id, request) in ready {
            self.count_out(request.protocol(), request.payload_len());
            self.actions.push(TransportAction::SendRequest {
                peer: *peer,
                request_id,
                request,
            });
        }
    }

    fn fail_peer_requests(&mut self, peer: &PeerId, failure: OutboundFailure) {
        let mut ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer == *peer)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        for id in ids {
            if let Some(pending) = self.pending.remove(&id) {
                self.slots.remove(&(pending.peer, pending.protocol.clone()));
                if let RequestOrigin::Internal(InternalTag::Notifications) = pending.origin {
                    continue;
                }
                self.resolve(*peer, pending.origin, Err(RequestFailure::Network(failure)));
            }
        }
    }

    /// Dial to `peer` failed: resolve everything parked for it.
    pub fn on_dial_failure(&mut self, peer: &PeerId) {
        self.fail_peer_requests(peer, OutboundFailure::DialFailure);
    }

    /// Tear down all per-peer state.
    pub fn on_disconnected(&mut self, peer: &PeerId) {
        self.fail_peer_requests(peer, OutboundFailure::ConnectionClosed);
        self.inbound.retain(|p| p.peer != *peer);

        let open: Vec<String> = self
            .queues
            .keys()
            .filter(|(p, _)| p == peer)
            .map(|(_, protocol)| protocol.clone())
            .collect();
        for protocol in open {
            self.close_notifications(peer, &protocol);
        }
    }

    /// Open notification sinks for every protocol both sides support.
    /// Already open protocols are left alone. Returns the newly opened ones.
    pub fn open_notifications(&mut self, peer: PeerId, role: ObservedRole, remote_protocols: &[String]) -> Vec<String> {
        let mut wanted = vec![BLOCK_ANNOUNCES_PROTOCOL.to_string()];
        wanted.extend(
            self.handlers
                .iter()
                .filter(|(name, tx)| matches!(tx, HandlerTx::Notifications(_)) && remote_protocols.contains(name))
                .map(|(name, _)| name.clone()),
        );
        wanted.sort();

        let mut opened = Vec::new();
        for protocol in wanted {
            let key = (peer, protocol.clone());
            if self.queues.contains_key(&key) {
                continue;
            }
            let rx = self.sinks.open(peer, &protocol, self.queue_size);
            self.queues.insert(
                key,
                OutboundQueue {
                    rx,
                    in_flight: None,
                    held: None,
                },
            );
            if let Some(HandlerTx::Notifications(tx)) = self.handlers.get(&protocol) {
                if tx.try_send(NotificationEvent::Opened { peer, role }).is_err() {
                    warn!(%peer, protocol, "mux: handler lagging, open event dropped");
                }
            }
            debug!(%peer, protocol, "mux: notification stream opened");
            opened.push(protocol);
        }
        opened
    }

    fn close_notifications(&mut self, peer: &PeerId, protocol: &str) {
        self.sinks.close(peer, protocol);
        self.queues.remove(&(*peer, protocol.to_string()));
        if let Some(HandlerTx::Notifications(tx)) = self.handlers.get(protocol) {
            if tx.try_send(NotificationEvent::Closed { peer: *peer }).is_err() {
                warn!(%peer, protocol, "mux: handler lagging, close event dropped");
            }
        }
        debug!(%peer, protocol, "mux: notification stream closed");
    }

    /// Notification protocols open towards `peer`.
    pub fn open_protocols(&self, peer: &PeerId) -> Vec<String> {
        let mut open: Vec<String> = self
            .queues
            .keys()
            .filter(|(p, _)| p == peer)
            .map(|(_, protocol)| protocol.clone())
            .collect();
        open.sort();
        open
    }

    fn drain_queue(&mut self, key: &(PeerId, String), now: Instant) {
        let Some(queue) = self.queues.get_mut(key) else {
            return;
        };
        if queue.in_flight.is_some() {
            return;
        }

        let mut payloads = Vec::new();
        let mut bytes = 0;
        if let Some(held) = queue.held.take() {
            bytes += held.len();
            payloads.push(held);
        }
        while payloads.len() < MAX_NOTIFICATION_BATCH {
            let Ok(payload) = queue.rx.try_recv() else {
                break;
            };
            if payload.len() > MAX_BATCH_BYTES {
                warn!(peer = %key.0, protocol = %key.1, size = payload.len(), "mux: dropping oversized notification");
                continue;
            }
            if bytes + payload.len() > MAX_BATCH_BYTES {
                queue.held = Some(payload);
                break;
            }
            bytes += payload.len();
            payloads.push(payload);
        }
        if payloads.is_empty() {
            return;
        }

        let id = self.allocate_id();
        if let Some(queue) = self.queues.get_mut(key) {
            queue.in_flight = Some(id);
        }
        let (peer, protocol) = key.clone();
        let request = WireRequest::Notifications {
            protocol: protocol.clone(),
            payloads,
        };
        let entry = self.traffic.entry(protocol.clone()).or_default();
        entry.bytes_out += bytes as u64;
        entry.messages_out += 1;
        self.actions.push(TransportAction::SendRequest {
            peer,
            request_id: id,
            request,
        });
        self.pending.insert(
            id,
            PendingRequest {
                peer,
                protocol,
                origin: RequestOrigin::Internal(InternalTag::Notifications),
                deadline: now + self.inbound_timeout,
                parked: None,
            },
        );
    }

    /// Expire deadlines, collect handler answers and flush notification
    /// queues.
    pub fn tick(&mut self, now: Instant) {
        // Outbound deadlines and abandoned external requests.
        let mut expired: Vec<(RequestId, bool)> = self
            .pending
            .iter()
            .filter_map(|(id, p)| {
                let canceled = matches!(&p.origin, RequestOrigin::External(tx) if tx.is_closed());
                (canceled || p.deadline <= now).then_some((*id, canceled))
            })
            .collect();
        expired.sort();
        for (id, canceled) in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            let key = (pending.peer, pending.protocol.clone());
            if self.slots.get(&key) == Some(&id) {
                self.slots.remove(&key);
            }
            if canceled {
                trace!(peer = %pending.peer, protocol = %pending.protocol, %id, "mux: request abandoned by caller");
                continue;
            }
            debug!(peer = %pending.peer, protocol = %pending.protocol, %id, "mux: request timed out");
            match pending.origin {
                RequestOrigin::Internal(InternalTag::Notifications) => {
                    if let Some(queue) = self.queues.get_mut(&key) {
                        queue.in_flight = None;
                    }
                }
                origin => self.resolve(pending.peer, origin, Err(RequestFailure::Network(OutboundFailure::Timeout))),
            }
        }

        // Handler answers.
        let inbound = std::mem::take(&mut self.inbound);
        for mut pending in inbound {
            match pending.rx.try_recv() {
                Ok(answer) => {
                    for change in answer.reputation_changes {
                        self.outputs.push(MuxOutput::Report {
                            peer: pending.peer,
                            change,
                        });
                    }
                    let response = match answer.result {
                        Ok(payload) => WireResponse::Response(payload),
                        Err(()) => WireResponse::Refused,
                    };
                    self.respond(pending.request_id, &pending.protocol, response);
                }
                Err(oneshot::error::TryRecvError::Empty) if pending.deadline > now => self.inbound.push(pending),
                Err(_) => {
                    debug!(peer = %pending.peer, protocol = %pending.protocol, "mux: handler did not answer");
                    self.respond(pending.request_id, &pending.protocol, WireResponse::Refused);
                }
            }
        }

        // Notification queues.
        let mut keys: Vec<(PeerId, String)> = self
            .queues
            .iter()
            .filter(|(_, q)| q.in_flight.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        for key in keys {
            self.drain_queue(&key, now);
        }
    }

    pub fn traffic(&self) -> BTreeMap<String, ProtocolTraffic> {
        self.traffic.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn drain_actions(&mut self) -> Vec<TransportAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn drain_outputs(&mut self) -> Vec<MuxOutput> {
        std::mem::take(&mut self.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::STATUS_PROTOCOL;

    // ---- Helpers ----

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn mux() -> Multiplexer {
        Multiplexer::new(NotificationSinks::default(), TIMEOUT, 2, 8)
    }

    fn external() -> (RequestOrigin, oneshot::Receiver<Result<Vec<u8>, RequestFailure>>) {
        let (tx, rx) = oneshot::channel();
        (RequestOrigin::External(tx), rx)
    }

    fn sent_requests(mux: &mut Multiplexer) -> Vec<(PeerId, RequestId, WireRequest)> {
        mux.drain_actions()
            .into_iter()
            .filter_map(|a| match a {
                TransportAction::SendRequest {
                    peer,
                    request_id,
                    request,
                } => Some((peer, request_id, request)),
                _ => None,
            })
            .collect()
    }

    fn responses(mux: &mut Multiplexer) -> Vec<WireResponse> {
        mux.drain_actions()
            .into_iter()
            .filter_map(|a| match a {
                TransportAction::SendResponse { response, .. } => Some(response),
                _ => None,
            })
            .collect()
    }

    // ---- Registration ----

    #[test]
    fn register_rejects_bad_and_duplicate_names() {
        let mut mux = mux();
        assert!(mux.register_protocol("/app/chat/1", ProtocolKind::Notification).is_ok());
        assert_eq!(
            mux.register_protocol("/app/chat/1", ProtocolKind::RequestResponse).unwrap_err(),
            RegistrationError::AlreadyRegistered("/app/chat/1".into())
        );
        assert!(matches!(
            mux.register_protocol(STATUS_PROTOCOL, ProtocolKind::RequestResponse),
            Err(RegistrationError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            mux.register_protocol("no-slash", ProtocolKind::Notification),
            Err(RegistrationError::InvalidName(_))
        ));
        assert_eq!(mux.registered_protocols(), vec!["/app/chat/1".to_string()]);
    }

    // ---- Requests ----

    #[test]
    fn request_round_trip() {
        let mut mux = mux();
        let now = Instant::now();
        let peer = PeerId::random();
        let (origin, mut rx) = external();

        let id = mux
            .send_request(peer, "/app/rpc/1", b"ping".to_vec(), origin, TIMEOUT, true, IfDisconnected::ImmediateError, now)
            .unwrap();
        let sent = sent_requests(&mut mux);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, id);

        mux.on_response(peer, id, Ok(WireResponse::Response(b"pong".to_vec())), now);
        assert_eq!(rx.try_recv().unwrap(), Ok(b"pong".to_vec()));
        assert_eq!(mux.pending_requests(), 0);
        let traffic = mux.traffic()["/app/rpc/1"];
        assert_eq!((traffic.bytes_out, traffic.bytes_in), (4, 4));
    }

    /// A second request on the same (peer, protocol) supersedes the first.
    #[test]
    fn newer_request_supersedes() {
        let mut mux = mux();
        let now = Instant::now();
        let peer = PeerId::random();
        let (first, mut first_rx) = external();
        let (second, mut second_rx) = external();

        let old = mux
            .send_request(peer, "/app/rpc/1", vec![1], first, TIMEOUT, true, IfDisconnected::ImmediateError, now)
            .unwrap();
        let new = mux
            .send_request(peer, "/app/rpc/1", vec![2], second, TIMEOUT, true, IfDisconnected::ImmediateError, now)
            .unwrap();
        assert_eq!(first_rx.try_recv().unwrap(), Err(RequestFailure::Obsolete));

        // The late answer to the first request is ignored.
        mux.on_response(peer, old, Ok(WireResponse::Response(vec![9])), now);
        assert!(second_rx.try_recv().is_err());
        mux.on_response(peer, new, Ok(WireResponse::Response(vec![3])), now);
        assert_eq!(second_rx.try_recv().unwrap(), Ok(vec![3]));
    }

    #[test]
    fn disconnected_immediate_error() {
        let mut mux = mux();
        let (origin, mut rx) = external();
        let id = mux.send_request(
            PeerId::random(),
            "/app/rpc/1",
            vec![],
            origin,
            TIMEOUT,
            false,
            IfDisconnected::ImmediateError,
            Instant::now(),
        );
        assert!(id.is_none());
        assert_eq!(rx.try_recv().unwrap(), Err(RequestFailure::NotConnected));
    }

    /// TryConnect parks the request, asks for a dial and sends on connect.
    #[test]
    fn try_connect_parks_until_connected() {
        let mut mux = mux();
        let now = Instant::now();
        let peer = PeerId::random();
        let (origin, _rx) = external();
        mux.send_request(peer, "/app/rpc/1", vec![1], origin, TIMEOUT, false, IfDisconnected::TryConnect, now)
            .unwrap();
        assert!(sent_requests(&mut mux).is_empty());
        assert_eq!(mux.drain_outputs(), vec![MuxOutput::Dial { peer }]);

        mux.on_connected(&peer);
        assert_eq!(sent_requests(&mut mux).len(), 1);
    }

    #[test]
    fn dial_failure_resolves_parked() {
        let mut mux = mux();
        let peer = PeerId::random();
        let (origin, mut rx) = external();
        mux.send_request(peer, "/app/rpc/1", vec![1], origin, TIMEOUT, false, IfDisconnected::TryConnect, Instant::now())
            .unwrap();
        mux.on_dial_failure(&peer);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RequestFailure::Network(OutboundFailure::DialFailure))
        );
    }

    #[test]
    fn deadline_times_out_internal_request() {
        let mut mux = mux();
        let now = Instant::now();
        let peer = PeerId::random();
        mux.send_request(
            peer,
            STATUS_PROTOCOL,
            vec![],
            RequestOrigin::Internal(InternalTag::Status),
            TIMEOUT,
            true,
            IfDisconnected::ImmediateError,
            now,
        );
        mux.drain_outputs();
        mux.tick(now + TIMEOUT - Duration::from_millis(1));
        assert!(mux.drain_outputs().is_empty());
        mux.tick(now + TIMEOUT);
        assert_eq!(
            mux.drain_outputs(),
            vec![MuxOutput::Response {
                peer,
                tag: InternalTag::Status,
                result: Err(RequestFailure::Network(OutboundFailure::Timeout)),
            }]
        );
    }

    /// Dropping the caller's receiver frees the slot without a result.
    #[test]
    fn canceled_request_frees_slot() {
        let mut mux = mux();
        let now = Instant::now();
        let (origin, rx) = external();
        mux.send_request(PeerId::random(), "/app/rpc/1", vec![], origin, TIMEOUT, true, IfDisconnected::ImmediateError, now);
        drop(rx);
        mux.tick(now);
        assert_eq!(mux.pending_requests(), 0);
    }

    // ---- Inbound ----

    #[test]
    fn inbound_unknown_protocol() {
        let mut mux = mux();
        let request = WireRequest::Request {
            protocol: "/nope/1".into(),
            payload: vec![],
        };
        mux.on_inbound_request(PeerId::random(), RequestId(7), request, Instant::now());
        assert_eq!(responses(&mut mux), vec![WireResponse::UnknownProtocol]);
    }

    #[test]
    fn inbound_builtin_goes_to_worker() {
        let mut mux = mux();
        let peer = PeerId::random();
        let request = WireRequest::Request {
            protocol: STATUS_PROTOCOL.into(),
            payload: vec![1, 2],
        };
        mux.on_inbound_request(peer, RequestId(7), request, Instant::now());
        assert_eq!(
            mux.drain_outputs(),
            vec![MuxOutput::BuiltinRequest {
                peer,
                request_id: RequestId(7),
                protocol: STATUS_PROTOCOL.into(),
                payload: vec![1, 2],
            }]
        );
    }

    /// Handler answers are returned on the next tick with their reputation changes.
    #[test]
    fn handler_answers_inbound_request() {
        let mut mux = mux();
        let now = Instant::now();
        let peer = PeerId::random();
        let ProtocolHandle::Requests(mut handler) = mux.register_protocol("/app/rpc/1", ProtocolKind::RequestResponse).unwrap()
        else {
            panic!("expected request handle");
        };
        let request = WireRequest::Request {
            protocol: "/app/rpc/1".into(),
            payload: b"q".to_vec(),
        };
        mux.on_inbound_request(peer, RequestId(1), request, now);

        let incoming = handler.try_recv().unwrap();
        assert_eq!(incoming.payload, b"q");
        let bonus = ReputationChange::new(3, "good question");
        incoming
            .pending_response
            .send(OutgoingResponse {
                result: Ok(b"a".to_vec()),
                reputation_changes: vec![bonus],
            })
            .unwrap();

        mux.tick(now);
        assert_eq!(responses(&mut mux), vec![WireResponse::Response(b"a".to_vec())]);
        assert_eq!(mux.drain_outputs(), vec![MuxOutput::Report { peer, change: bonus }]);
    }

    #[test]
    fn unanswered_inbound_refused_at_deadline() {
        let mut mux = mux();
        let now = Instant::now();
        let ProtocolHandle::Requests(_handler) = mux.register_protocol("/app/rpc/1", ProtocolKind::RequestResponse).unwrap()
        else {
            panic!("expected request handle");
        };
        let request = WireRequest::Request {
            protocol: "/app/rpc/1".into(),
            payload: vec![],
        };
        mux.on_inbound_request(PeerId::random(), RequestId(1), request, now);
        mux.tick(now + Duration::from_secs(1));
        assert!(responses(&mut mux).is_empty());
        mux.tick(now + TIMEOUT);
        assert_eq!(responses(&mut mux), vec![WireResponse::Refused]);
    }

    // ---- Notifications ----

    #[test]
    fn reserve_then_send_and_disconnect() {
        let mut mux = mux();
        let peer = PeerId::random();
        let _handle = mux.register_protocol("/app/chat/1", ProtocolKind::Notification).unwrap();
        let sinks = mux.sinks().clone();
        assert_eq!(
            sinks.sender(&peer, "/app/chat/1").unwrap_err(),
            NotificationError::NotConnected
        );
        assert_eq!(
            sinks.sender(&peer, "/app/other/1").unwrap_err(),
            NotificationError::UnknownProtocol
        );

        mux.open_notifications(peer, ObservedRole::Full, &["/app/chat/1".to_string()]);
        let sender = sinks.sender(&peer, "/app/chat/1").unwrap();
        let ready = sender.reserve().unwrap();
        let stale = sender.reserve().unwrap();
        // Queue size 2: both slots taken.
        assert_eq!(sender.reserve().unwrap_err(), NotificationError::QueueFull);
        ready.send(b"hi".to_vec()).unwrap();

        mux.on_disconnected(&peer);
        assert_eq!(stale.send(b"late".to_vec()), Err(NotificationError::NotConnected));
        assert_eq!(sender.reserve().unwrap_err(), NotificationError::NotConnected);
    }

    /// One batch in flight per (peer, protocol); the next waits for the ack.
    #[test]
    fn notifications_stop_and_wait() {
        let mut mux = Multiplexer::new(NotificationSinks::default(), TIMEOUT, 8, 8);
        let now = Instant::now();
        let peer = PeerId::random();
        mux.open_notifications(peer, ObservedRole::Full, &[]);
        let sender = mux.sinks().sender(&peer, BLOCK_ANNOUNCES_PROTOCOL).unwrap();

        sender.reserve().unwrap().send(vec![1]).unwrap();
        sender.reserve().unwrap().send(vec![2]).unwrap();
        mux.tick(now);
        let sent = sent_requests(&mut mux);
        assert_eq!(sent.len(), 1);
        let (_, first_id, request) = &sent[0];
        assert_eq!(
            request,
            &WireRequest::Notifications {
                protocol: BLOCK_ANNOUNCES_PROTOCOL.into(),
                payloads: vec![vec![1], vec![2]],
            }
        );

        sender.reserve().unwrap().send(vec![3]).unwrap();
        mux.tick(now);
        assert!(sent_requests(&mut mux).is_empty(), "batch still in flight");

        mux.on_response(peer, *first_id, Ok(WireResponse::Ack), now);
        let sent = sent_requests(&mut mux);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].2, WireRequest::Notifications { payloads, .. } if payloads == &vec![vec![3]]));
    }

    #[test]
    fn inbound_notifications_reach_handler() {
        let mut mux = mux();
        let peer = PeerId::random();
        let ProtocolHandle::Notifications(mut events) = mux.register_protocol("/app/chat/1", ProtocolKind::Notification).unwrap()
        else {
            panic!("expected notification handle");
        };
        let batch = WireRequest::Notifications {
            protocol: "/app/chat/1".into(),
            payloads: vec![b"a".to_vec()],
        };

        mux.on_inbound_request(peer, RequestId(1), batch.clone(), Instant::now());
        assert_eq!(responses(&mut mux), vec![WireResponse::Refused], "stream not open yet");

        mux.open_notifications(peer, ObservedRole::Light, &["/app/chat/1".to_string()]);
        mux.on_inbound_request(peer, RequestId(2), batch, Instant::now());
        assert_eq!(responses(&mut mux), vec![WireResponse::Ack]);
        assert_eq!(
            events.try_recv().unwrap(),
            NotificationEvent::Opened {
                peer,
                role: ObservedRole::Light
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            NotificationEvent::Received {
                peer,
                payload: b"a".to_vec()
            }
        );

        mux.on_disconnected(&peer);
        assert_eq!(events.try_recv().unwrap(), NotificationEvent::Closed { peer });
    }
}
