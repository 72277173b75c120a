//! Read-only snapshots of the network.
//!
//! [`NetworkStatus`] is the cheap one, refreshed by the worker every tick
//! and read by the service without a round trip. [`NetworkState`] is the
//! full diagnostic dump, built on request and meant to be serialised.

use serde::Serialize;
use std::collections::BTreeMap;
use weft_core::types::BlockNumber;

use crate::multiplexer::ProtocolTraffic;
use crate::peerset::{ConnectionState, KnownPeer, PeerInfo};
use crate::protocol::ObservedRole;
use crate::sync::SyncState;

/// Immutable status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub num_connected_peers: usize,
    pub total_bytes_inbound: u64,
    pub total_bytes_outbound: u64,
    pub sync: SyncState,
}

impl NetworkStatus {
    /// Sum per-protocol counters into a snapshot.
    pub fn new(num_connected_peers: usize, traffic: &BTreeMap<String, ProtocolTraffic>, sync: SyncState) -> Self {
        Self {
            num_connected_peers,
            total_bytes_inbound: traffic.values().map(|t| t.bytes_in).sum(),
            total_bytes_outbound: traffic.values().map(|t| t.bytes_out).sum(),
            sync,
        }
    }
}

/// A peer holding a connection slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerState {
    pub peer_id: String,
    pub state: ConnectionState,
    pub role: Option<ObservedRole>,
    pub reputation: i32,
    pub protocols: Vec<String>,
    /// Notification streams currently open towards the peer.
    pub open_notifications: Vec<String>,
    pub addresses: Vec<String>,
    pub reserved: bool,
    pub inbound: bool,
    pub best_number: Option<BlockNumber>,
}

impl PeerState {
    pub fn new(info: &PeerInfo, open_notifications: Vec<String>) -> Self {
        Self {
            peer_id: info.peer_id.to_string(),
            state: info.state,
            role: info.role,
            reputation: info.reputation,
            protocols: info.protocols.clone(),
            open_notifications,
            addresses: info.addresses.iter().map(ToString::to_string).collect(),
            reserved: info.reserved,
            inbound: info.inbound,
            best_number: info.best_number,
        }
    }
}

/// An address-book entry without a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownPeerState {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub reserved: bool,
    pub reputation: i32,
}

impl KnownPeerState {
    pub fn new(peer: &libp2p::PeerId, known: &KnownPeer, reputation: i32) -> Self {
        Self {
            peer_id: peer.to_string(),
            addresses: known.addresses.iter().map(ToString::to_string).collect(),
            reserved: known.reserved,
            reputation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DhtState {
    pub routing_table_size: usize,
    pub records: usize,
    pub active_queries: usize,
}

/// Full diagnostic dump of the network layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkState {
    pub local_peer_id: String,
    pub listen_addresses: Vec<String>,
    /// Connection slots, highest reputation first.
    pub connected_peers: Vec<PeerState>,
    pub not_connected_peers: Vec<KnownPeerState>,
    /// Sorted.
    pub banned_peers: Vec<String>,
    pub registered_protocols: Vec<String>,
    pub traffic: BTreeMap<String, ProtocolTraffic>,
    pub dht: DhtState,
    pub sync: SyncState,
}

impl NetworkState {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
