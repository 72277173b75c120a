//! Per-peer, per-protocol rate limiting of inbound requests.
//!
//! Each (peer, protocol) pair keeps a [`VecDeque`] of request timestamps.
//! On every check the queue is pruned of entries older than the window, then
//! its length is compared against the limit. Time is supplied by the caller
//! so the worker's tick clock drives the window.

use libp2p::PeerId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// Sliding-window limiter for inbound requests.
///
/// Call [`RateLimiter::check_and_record`] before serving a request. A `false`
/// result means the request must be refused (and the peer penalised).
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    peers: HashMap<PeerId, HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            limit: config.requests_per_window,
            peers: HashMap::new(),
        }
    }

    fn prune(queue: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while queue
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            queue.pop_front();
        }
    }

    /// Returns `true` and records the request if `peer` is within its limit
    /// for `protocol`.
    pub fn check_and_record(&mut self, peer: &PeerId, protocol: &str, now: Instant) -> bool {
        let queue = self
            .peers
            .entry(*peer)
            .or_default()
            .entry(protocol.to_string())
            .or_default();
        Self::prune(queue, self.window, now);
        if queue.len() >= self.limit {
            debug!(%peer, protocol, count = queue.len(), limit = self.limit,
                "rate_limiter: request rate exceeded");
            return false;
        }
        queue.push_back(now);
        true
    }

    /// Requests counted for `peer` on `protocol` within the window ending at `now`.
    pub fn recent(&mut self, peer: &PeerId, protocol: &str, now: Instant) -> usize {
        let window = self.window;
        self.peers
            .get_mut(peer)
            .and_then(|p| p.get_mut(protocol))
            .map(|queue| {
                Self::prune(queue, window, now);
                queue.len()
            })
            .unwrap_or(0)
    }

    /// Remove all state for a peer. Call on disconnect.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_some() {
            debug!(%peer, "rate_limiter: peer removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window_secs: 60,
            requests_per_window: limit,
        })
    }

    /// Once the limit is reached the next request is refused.
    #[test]
    fn exceeds_rate_limit() {
        let mut rl = limiter(3);
        let peer = PeerId::random();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(rl.check_and_record(&peer, "/p/1", now));
        }
        assert!(!rl.check_and_record(&peer, "/p/1", now));
        assert_eq!(rl.recent(&peer, "/p/1", now), 3, "refused requests are not recorded");
    }

    /// Entries older than the window no longer count.
    #[test]
    fn rate_limit_window_slides() {
        let mut rl = limiter(2);
        let peer = PeerId::random();
        let start = Instant::now();
        assert!(rl.check_and_record(&peer, "/p/1", start));
        assert!(rl.check_and_record(&peer, "/p/1", start));
        assert!(!rl.check_and_record(&peer, "/p/1", start + Duration::from_secs(59)));
        assert!(rl.check_and_record(&peer, "/p/1", start + Duration::from_secs(60)));
    }

    /// Limits are independent per peer and per protocol.
    #[test]
    fn per_peer_and_protocol_isolation() {
        let mut rl = limiter(1);
        let a = PeerId::random();
        let b = PeerId::random();
        let now = Instant::now();
        assert!(rl.check_and_record(&a, "/p/1", now));
        assert!(!rl.check_and_record(&a, "/p/1", now));
        assert!(rl.check_and_record(&a, "/q/1", now));
        assert!(rl.check_and_record(&b, "/p/1", now));
    }

    #[test]
    fn peer_cleanup() {
        let mut rl = limiter(1);
        let peer = PeerId::random();
        let now = Instant::now();
        assert!(rl.check_and_record(&peer, "/p/1", now));
        rl.remove_peer(&peer);
        assert!(rl.check_and_record(&peer, "/p/1", now));
        // Removing twice is a no-op.
        rl.remove_peer(&peer);
        rl.remove_peer(&peer);
    }
}
