//! Content fetch by id: ask peers one at a time until one returns data
//! whose BLAKE3 hash is the requested id.

use libp2p::PeerId;
use std::collections::{HashSet, VecDeque};
use weft_core::types::Hash256;

use crate::protocol::BitswapRequest;

/// What a peer's answer did to the active fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Verified content.
    Found(Vec<u8>),
    /// The data does not hash to the id.
    Mismatch,
    /// The peer does not have it, or the request failed.
    Missing,
}

#[derive(Debug)]
struct ActiveFetch {
    cid: Hash256,
    tried: HashSet<PeerId>,
    current: Option<PeerId>,
}

/// One fetch at a time; further ids wait in order.
#[derive(Debug, Default)]
pub struct BitswapFetcher {
    queue: VecDeque<Hash256>,
    active: Option<ActiveFetch>,
}

impl BitswapFetcher {
    /// Queue `cid` unless it is already pending or active.
    pub fn enqueue(&mut self, cid: Hash256) {
        if self.active.as_ref().is_some_and(|a| a.cid == cid) || self.queue.contains(&cid) {
            return;
        }
        self.queue.push_back(cid);
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Make the next queued id active.
    pub fn start_next(&mut self) -> Option<Hash256> {
        if self.active.is_some() {
            return None;
        }
        let cid = self.queue.pop_front()?;
        self.active = Some(ActiveFetch {
            cid,
            tried: HashSet::new(),
            current: None,
        });
        Some(cid)
    }

    pub fn active_cid(&self) -> Option<Hash256> {
        self.active.as_ref().map(|a| a.cid)
    }

    pub fn current_peer(&self) -> Option<PeerId> {
        self.active.as_ref().and_then(|a| a.current)
    }

    /// Pick the first untried peer of `candidates` and build its request.
    /// `None` when every candidate has been tried.
    pub fn next_request(&mut self, candidates: &[PeerId]) -> Option<(PeerId, BitswapRequest)> {
        let active = self.active.as_mut()?;
        if active.current.is_some() {
            return None;
        }
        let peer = *candidates.iter().find(|p| !active.tried.contains(*p))?;
        active.tried.insert(peer);
        active.current = Some(peer);
        Some((peer, BitswapRequest { cid: active.cid }))
    }

    /// Judge `peer`'s answer for the active id.
    pub fn on_response(&mut self, peer: &PeerId, data: Option<Vec<u8>>) -> Option<FetchOutcome> {
        let active = self.active.as_mut()?;
        if active.current != Some(*peer) {
            return None;
        }
        active.current = None;
        Some(match data {
            Some(data) if Hash256::blake3(&data) == active.cid => FetchOutcome::Found(data),
            Some(_) => FetchOutcome::Mismatch,
            None => FetchOutcome::Missing,
        })
    }

    /// The peer in charge went away; it stays marked as tried.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        if let Some(active) = self.active.as_mut() {
            if active.current == Some(*peer) {
                active.current = None;
            }
        }
    }

    /// End the active fetch.
    pub fn finish(&mut self) -> Option<Hash256> {
        self.active.take().map(|a| a.cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_deduplicates() {
        let mut f = BitswapFetcher::default();
        let cid = Hash256::blake3(b"x");
        f.enqueue(cid);
        f.enqueue(cid);
        assert_eq!(f.start_next(), Some(cid));
        f.enqueue(cid);
        assert!(!f.has_queued());
    }

    /// Each peer is asked once; a bad answer moves on to the next.
    #[test]
    fn tries_each_peer_once() {
        let mut f = BitswapFetcher::default();
        let cid = Hash256::blake3(b"data");
        let peers = [PeerId::random(), PeerId::random()];
        f.enqueue(cid);
        f.start_next();

        let (first, req) = f.next_request(&peers).unwrap();
        assert_eq!((first, req.cid), (peers[0], cid));
        assert!(f.next_request(&peers).is_none(), "one request at a time");
        assert_eq!(f.on_response(&first, Some(b"junk".to_vec())), Some(FetchOutcome::Mismatch));

        let (second, _) = f.next_request(&peers).unwrap();
        assert_eq!(second, peers[1]);
        assert_eq!(
            f.on_response(&second, Some(b"data".to_vec())),
            Some(FetchOutcome::Found(b"data".to_vec()))
        );
        assert!(f.next_request(&peers).is_none(), "all tried");
        assert_eq!(f.finish(), Some(cid));
    }

    #[test]
    fn ignores_answers_from_other_peers() {
        let mut f = BitswapFetcher::default();
        f.enqueue(Hash256::ZERO);
        f.start_next();
        let peer = PeerId::random();
        f.next_request(&[peer]);
        assert_eq!(f.on_response(&PeerId::random(), None), None);
        assert_eq!(f.on_response(&peer, None), Some(FetchOutcome::Missing));
    }
}
