//! Kademlia-style distributed hash table.
//!
//! Keys are hashed with SHA-256 and ordered by XOR distance. The routing
//! table is flat (one entry per peer with its addresses); a lookup contacts
//! the closest known peers with parallelism `alpha` and learns closer peers
//! from every response.
//!
//! | Operation | Terminal event |
//! |-----------|----------------|
//! | `get_value` | `ValueFound` on the first record, else `ValueNotFound` at the deadline |
//! | `put_value` | `ValuePut` on the first acknowledgement, else `PutFailed` at the deadline |
//!
//! Each lookup hands out a [`DhtSubscription`] that ends right after its
//! terminal event. A put keeps replicating towards `replication_factor`
//! peers after it reported success.
//!
//! The DHT never talks to the wire. It emits [`DhtOutput::Request`]s which
//! the worker routes through the multiplexer, and at most one request is in
//! flight per peer across all lookups.

use libp2p::futures::Stream;
use libp2p::{Multiaddr, PeerId};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use weft_core::error::RequestFailure;

use crate::config::DhtConfig;
use crate::protocol::{decode_message, DhtPeer, DhtRequest, DhtResponse};
use crate::reputation::{ReputationChange, BENEFIT_DHT_RESPONSE, COST_BAD_MESSAGE};

/// Routing table capacity.
pub const MAX_ROUTING_PEERS: usize = 1024;

type Distance = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

/// Outcome of a lookup, tagged with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtEvent {
    ValueFound { key: Vec<u8>, value: Vec<u8> },
    ValueNotFound { key: Vec<u8> },
    ValuePut { key: Vec<u8> },
    PutFailed { key: Vec<u8> },
}

impl DhtEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            DhtEvent::ValueFound { key, .. }
            | DhtEvent::ValueNotFound { key }
            | DhtEvent::ValuePut { key }
            | DhtEvent::PutFailed { key } => key,
        }
    }
}

/// Stream of events for one lookup. Ends after the terminal event.
#[derive(Debug)]
pub struct DhtSubscription {
    rx: mpsc::UnboundedReceiver<DhtEvent>,
}

impl DhtSubscription {
    /// A subscription and the sender feeding it.
    pub fn channel() -> (mpsc::UnboundedSender<DhtEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event if one is ready, without waiting.
    pub fn try_next(&mut self) -> Option<DhtEvent> {
        self.rx.try_recv().ok()
    }

    /// `true` once the lookup finished and every event was consumed.
    pub fn is_terminated(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }
}

impl Stream for DhtSubscription {
    type Item = DhtEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// What the DHT asks of the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DhtOutput {
    Request { peer: PeerId, query: QueryId, request: DhtRequest },
    /// Addresses learned from a lookup; feed the dial candidate pool.
    Discovered { peer: PeerId, addresses: Vec<Multiaddr> },
    Report { peer: PeerId, change: ReputationChange },
    /// A terminal event, mirrored on the worker's event stream.
    Event(DhtEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryKind {
    Get,
    Put { value: Vec<u8>, acks: usize },
    FindNode,
}

struct Query {
    key: Vec<u8>,
    target: Distance,
    kind: QueryKind,
    subscribers: Vec<mpsc::UnboundedSender<DhtEvent>>,
    /// Not yet contacted, closest first.
    candidates: BTreeMap<Distance, PeerId>,
    contacted: HashSet<PeerId>,
    in_flight: HashSet<PeerId>,
    deadline: Instant,
    /// Terminal event already delivered.
    resolved: bool,
}

impl Query {
    fn add_candidate(&mut self, peer: PeerId, key: &Distance) {
        if !self.contacted.contains(&peer) {
            self.candidates.insert(xor(key, &self.target), peer);
        }
    }

    fn finish(&mut self, event: DhtEvent, outputs: &mut Vec<DhtOutput>) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
        outputs.push(DhtOutput::Event(event));
    }

    /// Nothing left to learn or send.
    fn exhausted(&self) -> bool {
        self.in_flight.is_empty() && self.candidates.is_empty()
    }
}

struct Record {
    value: Vec<u8>,
    expires: Instant,
}

struct RoutingEntry {
    key: Distance,
    addresses: Vec<Multiaddr>,
}

/// SHA-256 position of `data` in the key space.
pub fn kad_key(data: &[u8]) -> Distance {
    Sha256::digest(data).into()
}

fn xor(a: &Distance, b: &Distance) -> Distance {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

pub struct Dht {
    local_peer_id: PeerId,
    config: DhtConfig,
    routing: HashMap<PeerId, RoutingEntry>,
    records: HashMap<Vec<u8>, Record>,
    queries: BTreeMap<QueryId, Query>,
    next_query: u64,
    /// Peers with a DHT request in flight, across all queries.
    busy: HashSet<PeerId>,
    next_walk: Option<Instant>,
    outputs: Vec<DhtOutput>,
}

impl Dht {
    pub fn new(local_peer_id: PeerId, config: DhtConfig) -> Self {
        Self {
            local_peer_id,
            config,
            routing: HashMap::new(),
            records: HashMap::new(),
            queries: BTreeMap::new(),
            next_query: 0,
            busy: HashSet::new(),
            next_walk: None,
            outputs: Vec::new(),
        }
    }

    /// Add or refresh a routing entry.
    pub fn add_peer(&mut self, peer: PeerId, addresses: &[Multiaddr]) {
        if peer == self.local_peer_id {
            return;
        }
        if let Some(entry) = self.routing.get_mut(&peer) {
            for addr in addresses {
                if !entry.addresses.contains(addr) {
                    entry.addresses.push(addr.clone());
                }
            }
            return;
        }
        if self.routing.len() >= MAX_ROUTING_PEERS {
            trace!(%peer, "dht: routing table full");
            return;
        }
        self.routing.insert(
            peer,
            RoutingEntry {
                key: kad_key(&peer.to_bytes()),
                addresses: addresses.to_vec(),
            },
        );
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.routing.remove(peer);
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing.len()
    }

    /// Up to `count` routing peers closest to `target`, closest first.
    fn closest(&self, target: &Distance, count: usize, exclude: Option<&PeerId>) -> Vec<PeerId> {
        let mut peers: Vec<(Distance, PeerId)> = self
            .routing
            .iter()
            .filter(|(peer, _)| Some(*peer) != exclude)
            .map(|(peer, entry)| (xor(&entry.key, target), *peer))
            .collect();
        peers.sort();
        peers.into_iter().take(count).map(|(_, peer)| peer).collect()
    }

    fn new_query(
        &mut self,
        key: Vec<u8>,
        kind: QueryKind,
        subscriber: Option<mpsc::UnboundedSender<DhtEvent>>,
        now: Instant,
    ) -> QueryId {
        self.next_query += 1;
        let id = QueryId(self.next_query);
        let target = kad_key(&key);
        let mut query = Query {
            key,
            target,
            kind,
            subscribers: subscriber.into_iter().collect(),
            candidates: BTreeMap::new(),
            contacted: HashSet::new(),
            in_flight: HashSet::new(),
            deadline: now + self.config.query_timeout(),
            resolved: false,
        };
        for peer in self.closest(&target, self.config.replication_factor, None) {
            if let Some(entry) = self.routing.get(&peer) {
                query.add_candidate(peer, &entry.key);
            }
        }
        self.queries.insert(id, query);
        self.step(id);
        id
    }

    fn local_value(&self, key: &[u8], now: Instant) -> Option<Vec<u8>> {
        self.records
            .get(key)
            .filter(|r| r.expires > now)
            .map(|r| r.value.clone())
    }

    /// Look up `key`. Concurrent lookups of the same key share one query.
    pub fn get_value(&mut self, key: Vec<u8>, subscriber: mpsc::UnboundedSender<DhtEvent>, now: Instant) {
        if let Some(value) = self.local_value(&key, now) {
            debug!(key = %hex::encode(&key), "dht: local hit");
            let event = DhtEvent::ValueFound { key, value };
            let _ = subscriber.send(event.clone());
            self.outputs.push(DhtOutput::Event(event));
            return;
        }
        let shared = self
            .queries
            .values_mut()
            .find(|q| q.kind == QueryKind::Get && q.key == key && !q.resolved);
        if let Some(query) = shared {
            query.subscribers.push(subscriber);
            return;
        }
        let id = self.new_query(key, QueryKind::Get, Some(subscriber), now);
        debug!(query = id.0, "dht: get started");
    }

    /// Store `value` locally and replicate it to the closest peers.
    pub fn put_value(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        subscriber: mpsc::UnboundedSender<DhtEvent>,
        now: Instant,
    ) {
        if value.len() > self.config.max_record_size {
            debug!(size = value.len(), max = self.config.max_record_size, "dht: record too large");
            let event = DhtEvent::PutFailed { key };
            let _ = subscriber.send(event.clone());
            self.outputs.push(DhtOutput::Event(event));
            return;
        }
        self.store(key.clone(), value.clone(), now);
        let id = self.new_query(key, QueryKind::Put { value, acks: 0 }, Some(subscriber), now);
        debug!(query = id.0, "dht: put started");
    }

    fn store(&mut self, key: Vec<u8>, value: Vec<u8>, now: Instant) {
        self.records.insert(
            key,
            Record {
                value,
                expires: now + self.config.record_ttl(),
            },
        );
    }

    /// Fill the query's free request slots with its closest idle candidates.
    fn step(&mut self, id: QueryId) {
        let Some(query) = self.queries.get_mut(&id) else {
            return;
        };
        let wanted = match &query.kind {
            QueryKind::Put { acks, .. } => self.config.replication_factor.saturating_sub(*acks + query.in_flight.len()),
            _ if query.resolved => 0,
            _ => usize::MAX,
        };
        let slots = self
            .config
            .parallelism
            .saturating_sub(query.in_flight.len())
            .min(wanted);

        let picks: Vec<(Distance, PeerId)> = query
            .candidates
            .iter()
            .filter(|(_, peer)| !self.busy.contains(*peer))
            .take(slots)
            .map(|(d, p)| (*d, *p))
            .collect();
        for (distance, peer) in picks {
            query.candidates.remove(&distance);
            query.contacted.insert(peer);
            query.in_flight.insert(peer);
            self.busy.insert(peer);
            let request = match &query.kind {
                QueryKind::Get => DhtRequest::GetValue { key: query.key.clone() },
                QueryKind::Put { value, .. } => DhtRequest::PutValue {
                    key: query.key.clone(),
                    value: value.clone(),
                },
                QueryKind::FindNode => DhtRequest::FindNode { key: query.key.clone() },
            };
            trace!(%peer, query = id.0, "dht: request");
            self.outputs.push(DhtOutput::Request { peer, query: id, request });
        }
    }

    fn learn(&mut self, id: QueryId, closer: Vec<DhtPeer>) {
        for entry in closer.into_iter().take(self.config.replication_factor) {
            let Ok(peer) = PeerId::from_bytes(&entry.peer_id) else {
                continue;
            };
            if peer == self.local_peer_id {
                continue;
            }
            let addresses: Vec<Multiaddr> = entry.addresses.iter().filter_map(|a| a.parse().ok()).collect();
            if addresses.is_empty() {
                continue;
            }
            let known = self.routing.contains_key(&peer);
            self.add_peer(peer, &addresses);
            if !known {
                self.outputs.push(DhtOutput::Discovered {
                    peer,
                    addresses: addresses.clone(),
                });
            }
            let key = kad_key(&peer.to_bytes());
            if let Some(query) = self.queries.get_mut(&id) {
                query.add_candidate(peer, &key);
            }
        }
    }

    /// Handle the outcome of a request issued for `query`.
    pub fn on_response(&mut self, peer: PeerId, query: QueryId, result: Result<Vec<u8>, RequestFailure>) {
        self.busy.remove(&peer);
        let Some(q) = self.queries.get_mut(&query) else {
            return;
        };
        q.in_flight.remove(&peer);

        match result {
            Ok(bytes) => match decode_message::<DhtResponse>(&bytes) {
                Some(response) => {
                    self.outputs.push(DhtOutput::Report {
                        peer,
                        change: BENEFIT_DHT_RESPONSE,
                    });
                    self.apply_response(peer, query, response);
                }
                None => {
                    debug!(%peer, "dht: malformed response");
                    self.outputs.push(DhtOutput::Report {
                        peer,
                        change: COST_BAD_MESSAGE,
                    });
                }
            },
            Err(RequestFailure::Network(_)) | Err(RequestFailure::NotConnected) => {
                trace!(%peer, "dht: peer unreachable, dropping from routing table");
                self.routing.remove(&peer);
            }
            Err(err) => trace!(%peer, %err, "dht: request failed"),
        }

        self.step(query);
        // Resolved lookups with nothing left in flight are dropped, closing
        // their subscriptions.
        if let Some(q) = self.queries.get(&query) {
            let done = match q.kind {
                QueryKind::Get => q.resolved,
                QueryKind::Put { acks, .. } => {
                    q.resolved && (q.in_flight.is_empty() && (acks >= self.config.replication_factor || q.candidates.is_empty()))
                }
                QueryKind::FindNode => q.exhausted(),
            };
            if done {
                self.queries.remove(&query);
            }
        }
    }

    fn apply_response(&mut self, peer: PeerId, id: QueryId, response: DhtResponse) {
        let DhtResponse {
            record,
            closer_peers,
            stored,
        } = response;
        self.learn(id, closer_peers);

        let mut outputs = std::mem::take(&mut self.outputs);
        if let Some(query) = self.queries.get_mut(&id) {
            match &mut query.kind {
                QueryKind::Get => {
                    if let Some(value) = record {
                        debug!(%peer, query = id.0, "dht: value found");
                        let key = query.key.clone();
                        query.finish(DhtEvent::ValueFound { key, value }, &mut outputs);
                    }
                }
                QueryKind::Put { acks, .. } => {
                    if stored {
                        *acks += 1;
                        let key = query.key.clone();
                        query.finish(DhtEvent::ValuePut { key }, &mut outputs);
                    }
                }
                QueryKind::FindNode => {}
            }
        }
        self.outputs = outputs;
    }

    /// Serve an inbound DHT request.
    pub fn handle_request(&mut self, peer: &PeerId, request: DhtRequest, now: Instant) -> DhtResponse {
        let closer = |dht: &Self, key: &[u8]| -> Vec<DhtPeer> {
            dht.closest(&kad_key(key), dht.config.replication_factor, Some(peer))
                .into_iter()
                .filter_map(|p| {
                    let entry = dht.routing.get(&p)?;
                    (!entry.addresses.is_empty()).then(|| DhtPeer {
                        peer_id: p.to_bytes(),
                        addresses: entry.addresses.iter().map(ToString::to_string).collect(),
                    })
                })
                .collect()
        };

        match request {
            DhtRequest::FindNode { key } => DhtResponse {
                closer_peers: closer(self, &key),
                ..DhtResponse::default()
            },
            DhtRequest::GetValue { key } => match self.local_value(&key, now) {
                Some(value) => DhtResponse {
                    record: Some(value),
                    ..DhtResponse::default()
                },
                None => DhtResponse {
                    closer_peers: closer(self, &key),
                    ..DhtResponse::default()
                },
            },
            DhtRequest::PutValue { key, value } => {
                let closer_peers = closer(self, &key);
                if value.len() > self.config.max_record_size {
                    debug!(%peer, size = value.len(), "dht: refusing oversized record");
                    return DhtResponse {
                        closer_peers,
                        ..DhtResponse::default()
                    };
                }
                self.store(key, value, now);
                DhtResponse {
                    record: None,
                    closer_peers,
                    stored: true,
                }
            }
        }
    }

    /// Expire deadlines and records, keep lookups moving, start random walks.
    pub fn tick(&mut self, now: Instant) {
        let expired: Vec<QueryId> = self
            .queries
            .iter()
            .filter(|(_, q)| q.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut outputs = std::mem::take(&mut self.outputs);
        for id in expired {
            let Some(mut query) = self.queries.remove(&id) else {
                continue;
            };
            let key = query.key.clone();
            match query.kind {
                QueryKind::Get => {
                    debug!(query = id.0, "dht: value not found before deadline");
                    query.finish(DhtEvent::ValueNotFound { key }, &mut outputs);
                }
                QueryKind::Put { .. } => {
                    debug!(query = id.0, "dht: put not acknowledged before deadline");
                    query.finish(DhtEvent::PutFailed { key }, &mut outputs);
                }
                QueryKind::FindNode => {}
            }
        }
        self.outputs = outputs;

        self.records.retain(|_, r| r.expires > now);

        let ids: Vec<QueryId> = self.queries.keys().copied().collect();
        for id in ids {
            self.step(id);
        }

        if let Some(interval) = self.config.random_walk_interval() {
            let due = *self.next_walk.get_or_insert(now + interval);
            if due <= now {
                self.next_walk = Some(now + interval);
                if !self.routing.is_empty() {
                    let target: [u8; 32] = rand::thread_rng().r#gen();
                    let id = self.new_query(target.to_vec(), QueryKind::FindNode, None, now);
                    trace!(query = id.0, "dht: random walk");
                }
            }
        }
    }

    pub fn active_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn drain_outputs(&mut self) -> Vec<DhtOutput> {
        std::mem::take(&mut self.outputs)
    }

    #[cfg(test)]
    fn query_deadline(&self, id: QueryId) -> Option<Instant> {
        self.queries.get(&id).map(|q| q.deadline)
    }
}
