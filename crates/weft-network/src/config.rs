//! Network configuration for the Weft P2P layer.
//!
//! Durations are stored as integer seconds/milliseconds so the structure can
//! be loaded from TOML or environment variables; use the accessor methods to
//! obtain [`Duration`]s.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::ObservedRole;

/// Default TCP port for P2P connections.
pub const DEFAULT_P2P_PORT: u16 = 30433;

/// Configuration for the P2P network node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Reserved peers as multiaddresses ending in `/p2p/<peer id>`.
    pub reserved_peers: Vec<String>,
    /// Only accept and dial reserved peers.
    pub reserved_only: bool,
    /// Enable mDNS peer discovery (useful for local networks).
    pub enable_mdns: bool,
    /// Role advertised in the status handshake.
    pub role: ObservedRole,
    /// Below this many peers the node actively dials candidates.
    pub min_peers: usize,
    /// Maximum number of non-reserved connected peers.
    pub max_peers: usize,
    /// Capacity of the address book of known, not necessarily connected peers.
    pub max_known_peers: usize,
    /// Timeout for outbound dial attempts.
    pub dial_timeout_secs: u64,
    /// Backoff before redialing a peer whose dial failed.
    pub redial_backoff_secs: u64,
    /// Where the node identity key is persisted. `None` uses an ephemeral key.
    pub node_key_path: Option<PathBuf>,
    /// Interval between worker ticks.
    pub tick_interval_ms: u64,
    /// Timeout applied to requests that do not carry their own.
    pub default_request_timeout_ms: u64,
    /// Capacity of each per-peer, per-protocol outbound notification queue.
    pub notification_queue_size: usize,
    /// Capacity of the channel feeding a registered protocol handler.
    pub handler_queue_size: usize,
    pub reputation: ReputationConfig,
    pub sync: SyncConfig,
    pub dht: DhtConfig,
    pub rate_limit: RateLimitConfig,
}

/// Reputation policy.
///
/// Scores are clamped to `[min_score, max_score]`; a score strictly below
/// `ban_threshold` bans the peer for `ban_duration_secs`. Every tick each
/// score moves towards zero by `|score| / decay_divisor`, at least one point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub min_score: i32,
    pub max_score: i32,
    pub ban_threshold: i32,
    pub decay_divisor: i32,
    pub ban_duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Start in warp sync instead of plain block sync.
    pub warp_sync: bool,
    /// Peers that must agree on a finalized block before it becomes the
    /// warp target.
    pub warp_quorum: usize,
    /// Maximum fragments a peer returns per warp proof response.
    pub max_warp_fragments: usize,
    /// A peer that served a bad proof is not asked again within this window.
    pub warp_retry_cooldown_secs: u64,
    /// Blocks per range request.
    pub block_range_size: u64,
    /// A peer that failed a range is not given the same range within this
    /// window.
    pub range_exclusion_secs: u64,
    /// State entries per state request.
    pub state_chunk_size: usize,
    /// Timeout for every sync request.
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// How long a lookup may run before it resolves.
    pub query_timeout_ms: u64,
    /// Number of closest peers a record is replicated to (Kademlia `k`).
    pub replication_factor: usize,
    /// Concurrent requests per lookup (Kademlia `alpha`).
    pub parallelism: usize,
    /// Largest value accepted into the record store.
    pub max_record_size: usize,
    /// How long stored records live.
    pub record_ttl_secs: u64,
    /// Interval between random-walk discovery lookups (0 disables).
    pub random_walk_interval_secs: u64,
}

/// Inbound request limits, applied per peer and protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub requests_per_window: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_P2P_PORT,
            reserved_peers: Vec::new(),
            reserved_only: false,
            enable_mdns: true,
            role: ObservedRole::Full,
            min_peers: 8,
            max_peers: 50,
            max_known_peers: 1000,
            dial_timeout_secs: 10,
            redial_backoff_secs: 30,
            node_key_path: None,
            tick_interval_ms: 100,
            default_request_timeout_ms: 20_000,
            notification_queue_size: 64,
            handler_queue_size: 256,
            reputation: ReputationConfig::default(),
            sync: SyncConfig::default(),
            dht: DhtConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            min_score: -1000,
            max_score: 1000,
            ban_threshold: -500,
            decay_divisor: 50,
            ban_duration_secs: 300,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            warp_sync: false,
            warp_quorum: 3,
            max_warp_fragments: 16,
            warp_retry_cooldown_secs: 60,
            block_range_size: 128,
            range_exclusion_secs: 60,
            state_chunk_size: 512,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 10_000,
            replication_factor: 20,
            parallelism: 3,
            max_record_size: 64 * 1024,
            record_ttl_secs: 36 * 60 * 60,
            random_walk_interval_secs: 60,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            requests_per_window: 300,
        }
    }
}

impl NetworkConfig {
    /// Configuration preset for local development: mDNS enabled, small peer set.
    pub fn local() -> Self {
        Self {
            enable_mdns: true,
            min_peers: 2,
            max_peers: 16,
            ..Self::default()
        }
    }

    /// Configuration preset for public networks: mDNS disabled.
    pub fn public() -> Self {
        Self {
            enable_mdns: false,
            ..Self::default()
        }
    }

    /// Build the libp2p multiaddr string for the configured listen address and port.
    pub fn listen_multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}", self.listen_addr, self.listen_port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn redial_backoff(&self) -> Duration {
        Duration::from_secs(self.redial_backoff_secs)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

/// Split a multiaddress ending in `/p2p/<peer id>` into the peer and the
/// address without that suffix.
pub fn parse_peer_addr(addr: &str) -> Option<(PeerId, Multiaddr)> {
    let mut addr: Multiaddr = addr.parse().ok()?;
    match addr.pop()? {
        Protocol::P2p(peer) => Some((peer, addr)),
        _ => None,
    }
}

impl ReputationConfig {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn warp_retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.warp_retry_cooldown_secs)
    }

    pub fn range_exclusion(&self) -> Duration {
        Duration::from_secs(self.range_exclusion_secs)
    }
}

impl DhtConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    /// `None` when random walks are disabled.
    pub fn random_walk_interval(&self) -> Option<Duration> {
        (self.random_walk_interval_secs > 0).then(|| Duration::from_secs(self.random_walk_interval_secs))
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}
