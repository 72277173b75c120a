//! Peer reputation engine.
//!
//! Every peer has an integer score, clamped to the configured bounds and
//! starting at zero. Misbehaviour applies negative [`ReputationChange`]s,
//! useful work positive ones. Once per tick every score moves towards zero
//! ([`ReputationEngine::decay_tick`]) so transient faults are forgiven.
//!
//! A score strictly below the ban threshold bans the peer for the configured
//! duration. The worker disconnects banned peers on the same tick and the
//! peer set refuses to dial them until the ban expires.

use libp2p::PeerId;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReputationConfig;

/// A reputation adjustment with a static reason used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationChange {
    pub value: i32,
    pub reason: &'static str,
}

impl ReputationChange {
    pub const fn new(value: i32, reason: &'static str) -> Self {
        Self { value, reason }
    }

    /// A change that drops the peer to the minimum score, banning it.
    pub const fn new_fatal(reason: &'static str) -> Self {
        Self {
            value: i32::MIN,
            reason,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.value == i32::MIN
    }

    /// This change applied `times` times, saturating.
    pub fn scaled(self, times: u32) -> Self {
        Self {
            value: self.value.saturating_mul(i32::try_from(times.max(1)).unwrap_or(i32::MAX)),
            reason: self.reason,
        }
    }
}

/// Undecodable or nonsensical message.
pub const COST_BAD_MESSAGE: ReputationChange = ReputationChange::new(-100, "malformed message");
/// Request timed out. Multiplied by the number of consecutive timeouts.
pub const COST_TIMEOUT: ReputationChange = ReputationChange::new(-50, "request timeout");
pub const COST_BAD_WARP_PROOF: ReputationChange = ReputationChange::new(-200, "invalid warp proof");
pub const COST_BAD_BLOCK: ReputationChange = ReputationChange::new(-300, "invalid block data");
pub const COST_BAD_STATE: ReputationChange = ReputationChange::new(-300, "invalid state data");
pub const COST_BAD_CONTENT: ReputationChange = ReputationChange::new(-200, "content does not match its id");
pub const COST_EMPTY_RESPONSE: ReputationChange = ReputationChange::new(-10, "empty response");
pub const COST_DIAL_FAILURE: ReputationChange = ReputationChange::new(-20, "dial failure");
pub const COST_UNSUPPORTED_PROTOCOL: ReputationChange = ReputationChange::new(-50, "unsupported protocol");
pub const COST_REFUSED: ReputationChange = ReputationChange::new(-10, "request refused");
pub const COST_RATE_LIMITED: ReputationChange = ReputationChange::new(-30, "request rate exceeded");
pub const COST_GENESIS_MISMATCH: ReputationChange = ReputationChange::new_fatal("genesis mismatch");
pub const BENEFIT_GOOD_BLOCKS: ReputationChange = ReputationChange::new(10, "useful block range");
pub const BENEFIT_GOOD_WARP_PROOF: ReputationChange = ReputationChange::new(20, "valid warp proof");
pub const BENEFIT_GOOD_STATE: ReputationChange = ReputationChange::new(5, "useful state chunk");
pub const BENEFIT_CONTENT: ReputationChange = ReputationChange::new(5, "content delivered");
pub const BENEFIT_DHT_RESPONSE: ReputationChange = ReputationChange::new(1, "dht response");

/// Result of applying a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationOutcome {
    Adjusted { score: i32 },
    /// This change pushed the peer below the ban threshold.
    Banned { score: i32 },
}

/// Per-peer reputation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReputation {
    pub score: i32,
    pub banned_until: Option<Instant>,
    /// Sum of the magnitudes of all negative changes.
    pub total_penalties: u64,
    /// Sum of all positive changes.
    pub total_bonuses: u64,
}

impl PeerReputation {
    fn new() -> Self {
        Self {
            score: 0,
            banned_until: None,
            total_penalties: 0,
            total_bonuses: 0,
        }
    }
}

/// Tracks reputation for every peer the node has interacted with.
pub struct ReputationEngine {
    config: ReputationConfig,
    peers: HashMap<PeerId, PeerReputation>,
}

impl ReputationEngine {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Apply `change` to `peer`.
    ///
    /// Fatal changes set the score to the minimum. The ban timer starts when
    /// the score first crosses below the threshold; later changes do not
    /// extend it.
    pub fn apply(&mut self, peer: &PeerId, change: ReputationChange, now: Instant) -> ReputationOutcome {
        let min = self.config.min_score;
        let max = self.config.max_score;
        let entry = self.peers.entry(*peer).or_insert_with(PeerReputation::new);

        if entry.banned_until.is_some_and(|until| until <= now) {
            entry.banned_until = None;
            entry.score = 0;
        }
        if change.is_fatal() {
            entry.score = min;
        } else {
            entry.score = (entry.score as i64 + change.value as i64).clamp(min as i64, max as i64) as i32;
        }
        if change.value < 0 {
            entry.total_penalties = entry.total_penalties.saturating_add(change.value.unsigned_abs() as u64);
        } else {
            entry.total_bonuses = entry.total_bonuses.saturating_add(change.value as u64);
        }

        debug!(%peer, score = entry.score, value = change.value, reason = change.reason, "reputation: change applied");

        if entry.score < self.config.ban_threshold && entry.banned_until.is_none() {
            entry.banned_until = Some(now + self.config.ban_duration());
            warn!(%peer, score = entry.score, reason = change.reason, "reputation: peer banned");
            return ReputationOutcome::Banned { score: entry.score };
        }
        ReputationOutcome::Adjusted { score: entry.score }
    }

    /// Current score, `0` for unknown peers.
    pub fn score(&self, peer: &PeerId) -> i32 {
        self.peers.get(peer).map(|r| r.score).unwrap_or(0)
    }

    /// Whether `peer` is banned at `now`.
    pub fn is_banned(&self, peer: &PeerId, now: Instant) -> bool {
        self.peers
            .get(peer)
            .and_then(|r| r.banned_until)
            .is_some_and(|until| until > now)
    }

    pub fn banned_peers(&self, now: Instant) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, r)| r.banned_until.is_some_and(|until| until > now))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Move every score towards zero and lift expired bans.
    ///
    /// A peer whose ban expired restarts from zero. Returns those peers.
    pub fn decay_tick(&mut self, now: Instant) -> Vec<PeerId> {
        let divisor = self.config.decay_divisor.max(1);
        let mut unbanned = Vec::new();

        for (peer, rep) in self.peers.iter_mut() {
            if let Some(until) = rep.banned_until {
                if until <= now {
                    rep.banned_until = None;
                    rep.score = 0;
                    unbanned.push(*peer);
                    info!(%peer, "reputation: ban expired");
                    continue;
                }
            }
            if rep.score != 0 {
                let step = (rep.score.abs() / divisor).max(1);
                rep.score -= step * rep.score.signum();
            }
        }
        unbanned
    }

    /// Drop the record for `peer` unless it carries a ban or a non-zero score.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        let removable = self
            .peers
            .get(peer)
            .is_some_and(|r| r.banned_until.is_none() && r.score == 0);
        if removable {
            self.peers.remove(peer);
            debug!(%peer, "reputation: record dropped");
        }
        removable
    }

    pub fn peer_info(&self, peer: &PeerId) -> Option<&PeerReputation> {
        self.peers.get(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for ReputationEngine {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}
