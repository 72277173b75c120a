//! Peer and connection manager.
//!
//! The [`PeerSet`] is an arena of [`PeerInfo`] records indexed by [`PeerId`]:
//! a peer maps to at most one record, and all cross references elsewhere in
//! the crate are by id. Alongside the connection slots it keeps an address
//! book of known peers (reserved, configured, discovered via the DHT, mDNS or
//! Identify) from which dial candidates are drawn.
//!
//! The peer set never performs I/O. The worker turns accepted `connect`
//! calls into dial actions and feeds transport outcomes back in.

use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use weft_core::error::DialError;
use weft_core::types::BlockNumber;

use crate::config::NetworkConfig;
use crate::protocol::ObservedRole;
use crate::reputation::ReputationEngine;

/// Addresses remembered per peer; later ones are dropped.
pub const MAX_ADDRESSES_PER_PEER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
}

/// Snapshot of a peer with a connection slot.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub state: ConnectionState,
    /// Learned from the status handshake.
    pub role: Option<ObservedRole>,
    /// Protocols the peer advertised in its status.
    pub protocols: Vec<String>,
    /// Filled in from the reputation engine when snapshotting.
    pub reputation: i32,
    pub addresses: Vec<Multiaddr>,
    pub reserved: bool,
    pub inbound: bool,
    pub best_number: Option<BlockNumber>,
}

/// A peer worth dialing and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialCandidate {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

/// Address-book entry, independent of any connection.
#[derive(Debug, Clone, Default)]
pub struct KnownPeer {
    pub addresses: Vec<Multiaddr>,
    pub reserved: bool,
    pub protocols: Vec<String>,
    pub backoff_until: Option<Instant>,
}

struct Slot {
    info: PeerInfo,
    since: Instant,
}

pub struct PeerSet {
    local_peer_id: PeerId,
    min_peers: usize,
    max_peers: usize,
    reserved_only: bool,
    dial_timeout: Duration,
    redial_backoff: Duration,
    /// Candidates known to lack any of these are never dialed.
    required_protocols: Vec<String>,
    slots: HashMap<PeerId, Slot>,
    known: HashMap<PeerId, KnownPeer>,
    max_known: usize,
}

impl PeerSet {
    pub fn new(local_peer_id: PeerId, config: &NetworkConfig, required_protocols: Vec<String>) -> Self {
        Self {
            local_peer_id,
            min_peers: config.min_peers,
            max_peers: config.max_peers,
            reserved_only: config.reserved_only,
            dial_timeout: config.dial_timeout(),
            redial_backoff: config.redial_backoff(),
            required_protocols,
            slots: HashMap::new(),
            known: HashMap::new(),
            max_known: config.max_known_peers.max(1),
        }
    }

    fn in_backoff(&self, peer: &PeerId, now: Instant) -> bool {
        self.known
            .get(peer)
            .and_then(|k| k.backoff_until)
            .is_some_and(|until| until > now)
    }

    fn is_reserved(&self, peer: &PeerId) -> bool {
        self.known.get(peer).is_some_and(|k| k.reserved)
    }

    fn non_reserved_slots(&self) -> usize {
        self.slots.values().filter(|s| !s.info.reserved).count()
    }

    fn merge_addresses(&mut self, peer: PeerId, addresses: &[Multiaddr]) -> bool {
        let entry = self.known.entry(peer).or_default();
        let mut added = false;
        for addr in addresses {
            if entry.addresses.len() >= MAX_ADDRESSES_PER_PEER {
                break;
            }
            if !entry.addresses.contains(addr) {
                entry.addresses.push(addr.clone());
                added = true;
            }
        }
        added
    }

    fn new_info(&self, peer: PeerId, state: ConnectionState, inbound: bool) -> PeerInfo {
        let known = self.known.get(&peer);
        PeerInfo {
            peer_id: peer,
            state,
            role: None,
            protocols: known.map(|k| k.protocols.clone()).unwrap_or_default(),
            reputation: 0,
            addresses: known.map(|k| k.addresses.clone()).unwrap_or_default(),
            reserved: known.is_some_and(|k| k.reserved),
            inbound,
            best_number: None,
        }
    }

    /// Accept `candidate` for dialing.
    ///
    /// On success the peer occupies a `Connecting` slot and the caller must
    /// dial [`PeerSet::addresses`].
    pub fn connect(
        &mut self,
        candidate: DialCandidate,
        reputation: &ReputationEngine,
        now: Instant,
    ) -> Result<PeerId, DialError> {
        let peer = candidate.peer_id;
        if peer == self.local_peer_id {
            return Err(DialError::LocalPeer);
        }
        if reputation.is_banned(&peer, now) || self.in_backoff(&peer, now) {
            return Err(DialError::Banned);
        }
        if self.slots.contains_key(&peer) {
            return Err(DialError::AlreadyConnected);
        }
        let reserved = self.is_reserved(&peer);
        if self.reserved_only && !reserved {
            return Err(DialError::NotReserved);
        }
        if !reserved && self.non_reserved_slots() >= self.max_peers {
            return Err(DialError::TooManyPeers);
        }
        self.merge_addresses(peer, &candidate.addresses);
        if self.addresses(&peer).is_empty() {
            return Err(DialError::NoAddresses);
        }

        let info = self.new_info(peer, ConnectionState::Connecting, false);
        self.slots.insert(peer, Slot { info, since: now });
        debug!(%peer, reserved, "peerset: dialing");
        Ok(peer)
    }

    /// Begin closing the connection to `peer`. Returns `false` if the peer
    /// had no slot.
    pub fn disconnect(&mut self, peer: &PeerId, reason: &str) -> bool {
        let Some(slot) = self.slots.get_mut(peer) else {
            return false;
        };
        match slot.info.state {
            ConnectionState::Connecting => {
                self.slots.remove(peer);
            }
            ConnectionState::Connected => slot.info.state = ConnectionState::Disconnecting,
            ConnectionState::Disconnecting => {}
        }
        info!(%peer, reason, "peerset: disconnecting");
        true
    }

    /// Admit an established connection, inbound or the result of a dial.
    ///
    /// On error the caller must close the connection.
    pub fn on_connection_established(
        &mut self,
        peer: PeerId,
        address: Option<Multiaddr>,
        inbound: bool,
        reputation: &ReputationEngine,
        now: Instant,
    ) -> Result<(), DialError> {
        if reputation.is_banned(&peer, now) {
            self.slots.remove(&peer);
            return Err(DialError::Banned);
        }
        if let Some(addr) = &address {
            if !inbound {
                self.merge_addresses(peer, std::slice::from_ref(addr));
            }
        }

        match self.slots.get_mut(&peer) {
            Some(slot) if slot.info.state == ConnectionState::Connecting => {
                slot.info.state = ConnectionState::Connected;
                slot.since = now;
            }
            Some(_) => return Err(DialError::AlreadyConnected),
            None => {
                let reserved = self.is_reserved(&peer);
                if self.reserved_only && !reserved {
                    return Err(DialError::NotReserved);
                }
                if !reserved && self.non_reserved_slots() >= self.max_peers {
                    return Err(DialError::TooManyPeers);
                }
                let info = self.new_info(peer, ConnectionState::Connected, inbound);
                self.slots.insert(peer, Slot { info, since: now });
            }
        }
        info!(%peer, inbound, connected = self.num_connected(), "peerset: peer connected");
        Ok(())
    }

    /// Release the slot. Returns the record if the peer had been connected.
    pub fn on_connection_closed(&mut self, peer: &PeerId) -> Option<PeerInfo> {
        let slot = self.slots.remove(peer)?;
        if slot.info.state == ConnectionState::Connecting {
            return None;
        }
        info!(%peer, connected = self.num_connected(), "peerset: peer disconnected");
        Some(slot.info)
    }

    /// A dial failed: release the slot and back off from the peer.
    pub fn on_dial_failure(&mut self, peer: &PeerId, now: Instant) -> bool {
        let was_dialing = self
            .slots
            .get(peer)
            .is_some_and(|s| s.info.state == ConnectionState::Connecting);
        if was_dialing {
            self.slots.remove(peer);
        }
        if let Some(known) = self.known.get_mut(peer) {
            known.backoff_until = Some(now + self.redial_backoff);
        }
        debug!(%peer, "peerset: dial failed, backing off");
        was_dialing
    }

    /// Dials pending for longer than the dial timeout. Their slots are
    /// released as failed dials.
    pub fn check_dial_timeouts(&mut self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|(_, s)| {
                s.info.state == ConnectionState::Connecting
                    && now.saturating_duration_since(s.since) >= self.dial_timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for peer in &expired {
            self.on_dial_failure(peer, now);
        }
        expired
    }

    /// Learn addresses for a peer. Returns `true` if anything new was added.
    ///
    /// A full address book makes room by forgetting its lowest-scored peer
    /// that is neither reserved, connected nor banned. If there is none the
    /// newcomer is dropped.
    pub fn add_discovered(
        &mut self,
        peer: PeerId,
        addresses: &[Multiaddr],
        reputation: &ReputationEngine,
        now: Instant,
    ) -> bool {
        if peer == self.local_peer_id || addresses.is_empty() {
            return false;
        }
        if !self.known.contains_key(&peer) && self.known.len() >= self.max_known {
            let victim = self
                .known
                .iter()
                .filter(|(id, k)| !k.reserved && !self.slots.contains_key(*id) && !reputation.is_banned(id, now))
                .map(|(id, _)| (reputation.score(id), *id))
                .min();
            let Some((_, victim)) = victim else {
                trace!(%peer, "peerset: address book full");
                return false;
            };
            self.known.remove(&victim);
            trace!(%victim, %peer, "peerset: evicted from address book");
        }
        self.merge_addresses(peer, addresses)
    }

    pub fn num_known(&self) -> usize {
        self.known.len()
    }

    pub fn add_reserved(&mut self, peer: PeerId, addresses: &[Multiaddr]) {
        if peer == self.local_peer_id {
            return;
        }
        self.merge_addresses(peer, addresses);
        if let Some(k) = self.known.get_mut(&peer) {
            k.reserved = true;
        }
        if let Some(slot) = self.slots.get_mut(&peer) {
            slot.info.reserved = true;
        }
    }

    /// Returns `true` if the peer is connected and must now be dropped
    /// because only reserved peers are allowed.
    pub fn remove_reserved(&mut self, peer: &PeerId) -> bool {
        if let Some(k) = self.known.get_mut(peer) {
            k.reserved = false;
        }
        match self.slots.get_mut(peer) {
            Some(slot) => {
                slot.info.reserved = false;
                self.reserved_only
            }
            None => false,
        }
    }

    /// Record what a peer told us in its status.
    pub fn set_status(&mut self, peer: &PeerId, role: ObservedRole, protocols: Vec<String>, best: BlockNumber) {
        if let Some(k) = self.known.get_mut(peer) {
            k.protocols = protocols.clone();
        }
        if let Some(slot) = self.slots.get_mut(peer) {
            slot.info.role = Some(role);
            slot.info.protocols = protocols;
            slot.info.best_number = Some(best);
        }
    }

    pub fn set_best(&mut self, peer: &PeerId, best: BlockNumber) {
        if let Some(slot) = self.slots.get_mut(peer) {
            if slot.info.best_number.is_none_or(|b| b < best) {
                slot.info.best_number = Some(best);
            }
        }
    }

    /// Peers to dial now.
    ///
    /// Reserved peers are always returned when not connected. Other peers are
    /// only proposed while below `min_peers`, confirmed-compatible peers
    /// first, then by reputation (highest first).
    pub fn dial_candidates(&self, reputation: &ReputationEngine, now: Instant) -> Vec<DialCandidate> {
        let dialable = |peer: &PeerId, known: &KnownPeer| {
            *peer != self.local_peer_id
                && !self.slots.contains_key(peer)
                && !known.addresses.is_empty()
                && !reputation.is_banned(peer, now)
                && !known.backoff_until.is_some_and(|until| until > now)
        };

        let mut reserved: Vec<DialCandidate> = self
            .known
            .iter()
            .filter(|(peer, k)| k.reserved && dialable(*peer, *k))
            .map(|(peer, k)| DialCandidate {
                peer_id: *peer,
                addresses: k.addresses.clone(),
            })
            .collect();
        reserved.sort_by_key(|c| c.peer_id);
        if self.reserved_only {
            return reserved;
        }

        let active = self.slots.len() + reserved.len();
        let wanted = self.min_peers.saturating_sub(active);
        if wanted == 0 {
            return reserved;
        }

        let mut others: Vec<(bool, i32, PeerId, &KnownPeer)> = self
            .known
            .iter()
            .filter(|(peer, k)| !k.reserved && dialable(*peer, *k))
            .filter_map(|(peer, k)| {
                let confirmed = !k.protocols.is_empty();
                let compatible = self.required_protocols.iter().all(|p| k.protocols.contains(p));
                if confirmed && !compatible {
                    return None;
                }
                Some((confirmed, reputation.score(peer), *peer, k))
            })
            .collect();
        others.sort_by_key(|(confirmed, score, peer, _)| (Reverse(*confirmed), Reverse(*score), *peer));

        reserved.extend(others.into_iter().take(wanted).map(|(_, _, peer, k)| DialCandidate {
            peer_id: peer,
            addresses: k.addresses.clone(),
        }));
        reserved
    }

    /// Connection slots ordered by reputation (highest first), then peer id.
    pub fn snapshot(&self, reputation: &ReputationEngine) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .slots
            .values()
            .map(|s| PeerInfo {
                reputation: reputation.score(&s.info.peer_id),
                ..s.info.clone()
            })
            .collect();
        peers.sort_by_key(|p| (Reverse(p.reputation), p.peer_id));
        peers
    }

    pub fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.known.get(peer).map(|k| k.addresses.clone()).unwrap_or_default()
    }

    pub fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.slots.get(peer).map(|s| s.info.state)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(ConnectionState::Connected)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .slots
            .values()
            .filter(|s| s.info.state == ConnectionState::Connected)
            .map(|s| s.info.peer_id)
            .collect();
        peers.sort();
        peers
    }

    pub fn num_connected(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.info.state == ConnectionState::Connected)
            .count()
    }

    /// Address-book entries without a connection slot.
    pub fn known_not_connected(&self) -> Vec<(PeerId, KnownPeer)> {
        let mut peers: Vec<(PeerId, KnownPeer)> = self
            .known
            .iter()
            .filter(|(peer, _)| !self.slots.contains_key(peer))
            .map(|(peer, k)| (*peer, k.clone()))
            .collect();
        peers.sort_by_key(|(peer, _)| *peer);
        peers
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::{ReputationChange, COST_GENESIS_MISMATCH};

    // ---- Helpers ----

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    fn candidate(peer: PeerId, port: u16) -> DialCandidate {
        DialCandidate {
            peer_id: peer,
            addresses: vec![addr(port)],
        }
    }

    fn peerset(min: usize, max: usize) -> PeerSet {
        let config = NetworkConfig {
            min_peers: min,
            max_peers: max,
            ..NetworkConfig::default()
        };
        PeerSet::new(PeerId::random(), &config, vec!["/weft/sync/blocks/1".into()])
    }

    fn connect_ok(set: &mut PeerSet, rep: &ReputationEngine, peer: PeerId, now: Instant) {
        set.connect(candidate(peer, 1), rep, now).unwrap();
        set.on_connection_established(peer, Some(addr(1)), false, rep, now).unwrap();
    }

    // ---- Tests ----

    #[test]
    fn connect_then_establish() {
        let mut set = peerset(2, 4);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        let peer = PeerId::random();

        assert_eq!(set.connect(candidate(peer, 1), &rep, now), Ok(peer));
        assert_eq!(set.state(&peer), Some(ConnectionState::Connecting));
        assert_eq!(set.connect(candidate(peer, 1), &rep, now), Err(DialError::AlreadyConnected));

        set.on_connection_established(peer, Some(addr(1)), false, &rep, now).unwrap();
        assert!(set.is_connected(&peer));
        assert_eq!(set.num_connected(), 1);
    }

    #[test]
    fn connect_rejections() {
        let mut set = peerset(2, 1);
        let mut rep = ReputationEngine::default();
        let now = Instant::now();

        let local = set.local_peer_id();
        assert_eq!(set.connect(candidate(local, 1), &rep, now), Err(DialError::LocalPeer));

        let no_addr = PeerId::random();
        let empty = DialCandidate {
            peer_id: no_addr,
            addresses: vec![],
        };
        assert_eq!(set.connect(empty, &rep, now), Err(DialError::NoAddresses));

        let banned = PeerId::random();
        rep.apply(&banned, COST_GENESIS_MISMATCH, now);
        assert_eq!(set.connect(candidate(banned, 1), &rep, now), Err(DialError::Banned));

        connect_ok(&mut set, &rep, PeerId::random(), now);
        assert_eq!(
            set.connect(candidate(PeerId::random(), 2), &rep, now),
            Err(DialError::TooManyPeers)
        );
    }

    /// Reserved peers bypass the slot limit.
    #[test]
    fn reserved_peers_ignore_max() {
        let mut set = peerset(1, 1);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        connect_ok(&mut set, &rep, PeerId::random(), now);

        let reserved = PeerId::random();
        set.add_reserved(reserved, &[addr(9)]);
        assert_eq!(set.connect(candidate(reserved, 9), &rep, now), Ok(reserved));
    }

    /// A failed dial backs the peer off for the redial window.
    #[test]
    fn dial_failure_backs_off() {
        let mut set = peerset(2, 4);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        let peer = PeerId::random();

        set.connect(candidate(peer, 1), &rep, now).unwrap();
        assert!(set.on_dial_failure(&peer, now));
        assert_eq!(set.state(&peer), None);
        assert_eq!(set.connect(candidate(peer, 1), &rep, now), Err(DialError::Banned));
        assert!(set.dial_candidates(&rep, now).is_empty());

        let later = now + Duration::from_secs(30);
        assert_eq!(set.connect(candidate(peer, 1), &rep, later), Ok(peer));

        // Failures towards peers outside the address book leave it alone.
        assert!(!set.on_dial_failure(&PeerId::random(), now));
        assert_eq!(set.num_known(), 1);
    }

    #[test]
    fn dial_timeout_releases_slot() {
        let mut set = peerset(2, 4);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        let peer = PeerId::random();
        set.connect(candidate(peer, 1), &rep, now).unwrap();

        assert!(set.check_dial_timeouts(now + Duration::from_secs(9)).is_empty());
        assert_eq!(set.check_dial_timeouts(now + Duration::from_secs(10)), vec![peer]);
        assert_eq!(set.state(&peer), None);
    }

    /// Banned peers are refused even when they connect to us.
    #[test]
    fn banned_inbound_refused() {
        let mut set = peerset(2, 4);
        let mut rep = ReputationEngine::default();
        let now = Instant::now();
        let peer = PeerId::random();
        rep.apply(&peer, COST_GENESIS_MISMATCH, now);
        assert_eq!(
            set.on_connection_established(peer, None, true, &rep, now),
            Err(DialError::Banned)
        );
        assert_eq!(set.state(&peer), None);
    }

    #[test]
    fn reserved_only_refuses_others() {
        let config = NetworkConfig {
            reserved_only: true,
            ..NetworkConfig::default()
        };
        let mut set = PeerSet::new(PeerId::random(), &config, vec![]);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        let stranger = PeerId::random();
        assert_eq!(
            set.on_connection_established(stranger, None, true, &rep, now),
            Err(DialError::NotReserved)
        );
        assert_eq!(set.connect(candidate(stranger, 1), &rep, now), Err(DialError::NotReserved));

        let friend = PeerId::random();
        set.add_reserved(friend, &[addr(2)]);
        set.on_connection_established(friend, None, true, &rep, now).unwrap();
        assert!(set.remove_reserved(&friend), "must be dropped in reserved-only mode");
    }

    /// Disconnect marks a connected peer and the close event releases it.
    #[test]
    fn disconnect_then_closed() {
        let mut set = peerset(2, 4);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        let peer = PeerId::random();
        connect_ok(&mut set, &rep, peer, now);

        assert!(set.disconnect(&peer, "test"));
        assert_eq!(set.state(&peer), Some(ConnectionState::Disconnecting));
        assert!(!set.is_connected(&peer));
        let info = set.on_connection_closed(&peer).unwrap();
        assert_eq!(info.peer_id, peer);
        assert!(set.on_connection_closed(&peer).is_none());
        assert!(!set.disconnect(&peer, "again"));
    }

    /// Candidates: reserved first, then confirmed-compatible, then by reputation.
    #[test]
    fn dial_candidates_ordering() {
        let mut set = peerset(4, 10);
        let mut rep = ReputationEngine::default();
        let now = Instant::now();

        let reserved = PeerId::random();
        let good = PeerId::random();
        let better = PeerId::random();
        let confirmed = PeerId::random();
        let incompatible = PeerId::random();

        set.add_reserved(reserved, &[addr(1)]);
        set.add_discovered(good, &[addr(2)], &rep, now);
        set.add_discovered(better, &[addr(3)], &rep, now);
        set.add_discovered(confirmed, &[addr(4)], &rep, now);
        set.add_discovered(incompatible, &[addr(5)], &rep, now);
        set.known.get_mut(&confirmed).unwrap().protocols = vec!["/weft/sync/blocks/1".into()];
        set.known.get_mut(&incompatible).unwrap().protocols = vec!["/other/1".into()];
        rep.apply(&good, ReputationChange::new(10, "test"), now);
        rep.apply(&better, ReputationChange::new(50, "test"), now);

        let order: Vec<PeerId> = set.dial_candidates(&rep, now).into_iter().map(|c| c.peer_id).collect();
        assert_eq!(order, vec![reserved, confirmed, better, good]);
    }

    /// No non-reserved candidates once the minimum is met.
    #[test]
    fn no_candidates_above_min() {
        let mut set = peerset(1, 10);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        connect_ok(&mut set, &rep, PeerId::random(), now);
        set.add_discovered(PeerId::random(), &[addr(7)], &rep, now);
        assert!(set.dial_candidates(&rep, now).is_empty());
    }

    /// A full address book forgets its least useful entry; reserved,
    /// connected and banned peers are never the ones dropped.
    #[test]
    fn address_book_is_bounded() {
        let config = NetworkConfig {
            max_known_peers: 4,
            ..NetworkConfig::default()
        };
        let mut set = PeerSet::new(PeerId::random(), &config, vec![]);
        let mut rep = ReputationEngine::default();
        let now = Instant::now();

        let (reserved, connected, banned, weak) =
            (PeerId::random(), PeerId::random(), PeerId::random(), PeerId::random());
        set.add_reserved(reserved, &[addr(1)]);
        connect_ok(&mut set, &rep, connected, now);
        assert!(set.add_discovered(banned, &[addr(3)], &rep, now));
        assert!(set.add_discovered(weak, &[addr(4)], &rep, now));
        rep.apply(&reserved, ReputationChange::new(-400, "test"), now);
        rep.apply(&connected, ReputationChange::new(-400, "test"), now);
        rep.apply(&banned, COST_GENESIS_MISMATCH, now);
        rep.apply(&weak, ReputationChange::new(-10, "test"), now);

        let newcomer = PeerId::random();
        assert!(set.add_discovered(newcomer, &[addr(5)], &rep, now));
        assert_eq!(set.num_known(), 4);
        assert!(set.addresses(&weak).is_empty());
        for kept in [reserved, connected, banned, newcomer] {
            assert!(!set.addresses(&kept).is_empty());
        }

        // Flooding never grows the book past its capacity.
        for i in 0..1000u16 {
            set.add_discovered(PeerId::random(), &[addr(100 + i)], &rep, now);
        }
        assert_eq!(set.num_known(), 4);
        for kept in [reserved, connected, banned] {
            assert!(!set.addresses(&kept).is_empty());
        }
    }

    #[test]
    fn full_book_of_protected_peers_drops_newcomers() {
        let config = NetworkConfig {
            max_known_peers: 1,
            ..NetworkConfig::default()
        };
        let mut set = PeerSet::new(PeerId::random(), &config, vec![]);
        let rep = ReputationEngine::default();
        let reserved = PeerId::random();
        set.add_reserved(reserved, &[addr(1)]);
        assert!(!set.add_discovered(PeerId::random(), &[addr(2)], &rep, Instant::now()));
        assert_eq!(set.num_known(), 1);
    }

    #[test]
    fn addresses_per_peer_are_capped() {
        let mut set = peerset(2, 10);
        let rep = ReputationEngine::default();
        let peer = PeerId::random();
        let many: Vec<Multiaddr> = (0..20).map(addr).collect();
        set.add_discovered(peer, &many, &rep, Instant::now());
        assert_eq!(set.addresses(&peer).len(), MAX_ADDRESSES_PER_PEER);
    }

    /// Snapshots are ordered by reputation, ties by peer id.
    #[test]
    fn snapshot_ordering() {
        let mut set = peerset(2, 10);
        let mut rep = ReputationEngine::default();
        let now = Instant::now();
        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        for p in &peers {
            connect_ok(&mut set, &rep, *p, now);
        }
        rep.apply(&peers[2], ReputationChange::new(100, "test"), now);
        rep.apply(&peers[3], ReputationChange::new(-100, "test"), now);

        let snap = set.snapshot(&rep);
        assert_eq!(snap[0].peer_id, peers[2]);
        assert_eq!(snap[0].reputation, 100);
        assert_eq!(snap[3].peer_id, peers[3]);
        assert!(snap[1].peer_id < snap[2].peer_id);
    }

    #[test]
    fn status_updates_record() {
        let mut set = peerset(2, 10);
        let rep = ReputationEngine::default();
        let now = Instant::now();
        let peer = PeerId::random();
        connect_ok(&mut set, &rep, peer, now);
        set.set_status(&peer, ObservedRole::Authority, vec!["/x/1".into()], 10);
        set.set_best(&peer, 8);
        set.set_best(&peer, 12);
        let info = &set.snapshot(&rep)[0];
        assert_eq!(info.role, Some(ObservedRole::Authority));
        assert_eq!(info.best_number, Some(12));
        assert_eq!(info.protocols, vec!["/x/1".to_string()]);
    }
}
