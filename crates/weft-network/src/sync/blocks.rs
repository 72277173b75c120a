//! Block-range download scheduling.
//!
//! Ranges are half-open `[start, end)`. Each peer holds at most one range.
//! Ranges returned by failed peers go back to the front of the queue and
//! are handed to a different peer; the failing peer is excluded from that
//! range for the exclusion window. Completed ranges are buffered and
//! released strictly in order.

use libp2p::PeerId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use weft_core::types::{Block, BlockNumber};

/// Completed ranges buffered ahead of the import point.
pub const MAX_BUFFERED_RANGES: usize = 32;

/// Verdict on a block response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    /// All requested blocks arrived.
    Complete,
    /// A valid prefix arrived; the rest was requeued.
    Partial { received: usize },
    Empty,
    Invalid,
    /// The peer held no range.
    Unexpected,
}

#[derive(Debug, Clone)]
struct Assignment {
    range: Range<BlockNumber>,
}

pub struct BlockDownload {
    range_size: u64,
    exclusion: Duration,
    /// First block number not yet assigned or queued.
    next_start: BlockNumber,
    /// Next block to hand to the importer.
    import_next: BlockNumber,
    queued: VecDeque<Range<BlockNumber>>,
    assigned: HashMap<PeerId, Assignment>,
    /// Completed ranges by start, with the peer that served them.
    completed: BTreeMap<BlockNumber, (PeerId, Vec<Block>)>,
    excluded: HashMap<(BlockNumber, BlockNumber), HashMap<PeerId, Instant>>,
    consecutive_timeouts: HashMap<PeerId, u32>,
}

impl BlockDownload {
    pub fn new(range_size: u64, exclusion: Duration, best: BlockNumber) -> Self {
        Self {
            range_size: range_size.max(1),
            exclusion,
            next_start: best.saturating_add(1),
            import_next: best.saturating_add(1),
            queued: VecDeque::new(),
            assigned: HashMap::new(),
            completed: BTreeMap::new(),
            excluded: HashMap::new(),
            consecutive_timeouts: HashMap::new(),
        }
    }

    /// Forget all progress and continue from `best`.
    pub fn reset(&mut self, best: BlockNumber) {
        self.next_start = best.saturating_add(1);
        self.import_next = best.saturating_add(1);
        self.queued.clear();
        self.assigned.clear();
        self.completed.clear();
        self.excluded.clear();
    }

    fn is_excluded(&self, range: &Range<BlockNumber>, peer: &PeerId, now: Instant) -> bool {
        self.excluded
            .get(&(range.start, range.end))
            .and_then(|peers| peers.get(peer))
            .is_some_and(|until| *until > now)
    }

    fn exclude(&mut self, range: &Range<BlockNumber>, peer: PeerId, now: Instant) {
        self.excluded
            .entry((range.start, range.end))
            .or_default()
            .insert(peer, now + self.exclusion);
    }

    /// Assign ranges to idle peers.
    ///
    /// `peers` must be ordered by best block, highest first. Each idle peer
    /// gets at most one range per call: requeued ranges first, then fresh
    /// ones, never beyond the peer's best block.
    pub fn schedule(&mut self, peers: &[(PeerId, BlockNumber)], now: Instant) -> Vec<(PeerId, Range<BlockNumber>)> {
        let mut out = Vec::new();
        for (peer, best) in peers {
            if self.assigned.contains_key(peer) {
                continue;
            }
            let requeued = self
                .queued
                .iter()
                .position(|r| r.start <= *best && !self.is_excluded(r, peer, now));
            // A full buffer still takes requeued ranges: they fill the gap
            // that blocks the import.
            let buffer_full = self.completed.len() >= MAX_BUFFERED_RANGES;
            let range = match requeued {
                Some(index) => match self.queued.remove(index) {
                    Some(range) => range,
                    None => continue,
                },
                None if !buffer_full && self.next_start <= *best => {
                    let end = self.next_start.saturating_add(self.range_size).min(best.saturating_add(1));
                    let range = self.next_start..end;
                    self.next_start = end;
                    range
                }
                None => continue,
            };

            trace!(%peer, start = range.start, end = range.end, "sync: range assigned");
            self.assigned.insert(*peer, Assignment { range: range.clone() });
            out.push((*peer, range));
        }
        out
    }

    pub fn assigned_range(&self, peer: &PeerId) -> Option<Range<BlockNumber>> {
        self.assigned.get(peer).map(|a| a.range.clone())
    }

    fn requeue(&mut self, range: Range<BlockNumber>) {
        if range.start < range.end {
            self.queued.push_front(range);
        }
    }

    /// Validate and buffer the blocks `peer` returned for its range.
    pub fn on_blocks(&mut self, peer: &PeerId, blocks: Vec<Block>, now: Instant) -> RangeOutcome {
        let Some(Assignment { range }) = self.assigned.remove(peer) else {
            return RangeOutcome::Unexpected;
        };
        if blocks.is_empty() {
            self.exclude(&range, *peer, now);
            self.requeue(range);
            return RangeOutcome::Empty;
        }

        let expected = usize::try_from(range.end.saturating_sub(range.start)).unwrap_or(usize::MAX);
        let mut number = range.start;
        let mut parent = None;
        let valid = blocks.len() <= expected
            && blocks.iter().all(|block| {
                let linked = parent.is_none_or(|hash| block.header.parent_hash == hash);
                let ok = block.number() == number && linked && block.is_well_formed();
                number += 1;
                parent = Some(block.hash());
                ok
            });
        if !valid {
            debug!(%peer, start = range.start, end = range.end, "sync: invalid block range");
            self.exclude(&range, *peer, now);
            self.requeue(range);
            return RangeOutcome::Invalid;
        }

        self.consecutive_timeouts.remove(peer);
        let received = blocks.len();
        self.completed.insert(range.start, (*peer, blocks));
        if received < expected {
            self.requeue(range.start + received as u64..range.end);
            return RangeOutcome::Partial { received };
        }
        RangeOutcome::Complete
    }

    /// The peer's request failed. Requeues its range and returns the number
    /// of consecutive timeouts when `timeout` is set.
    pub fn on_failure(&mut self, peer: &PeerId, timeout: bool, now: Instant) -> u32 {
        if let Some(Assignment { range }) = self.assigned.remove(peer) {
            debug!(%peer, start = range.start, end = range.end, timeout, "sync: range failed, requeued");
            self.exclude(&range, *peer, now);
            self.requeue(range);
        }
        if !timeout {
            return 0;
        }
        let count = self.consecutive_timeouts.entry(*peer).or_default();
        *count += 1;
        *count
    }

    /// Return the peer's range to the queue without blaming it.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        if let Some(Assignment { range }) = self.assigned.remove(peer) {
            self.requeue(range);
        }
        self.consecutive_timeouts.remove(peer);
    }

    /// Next completed range that continues the imported chain.
    pub fn next_ready(&mut self) -> Option<(PeerId, Vec<Block>)> {
        let (peer, blocks) = self.completed.remove(&self.import_next)?;
        self.import_next += blocks.len() as u64;
        Some((peer, blocks))
    }

    /// The importer rejected a range: drop it and fetch it again elsewhere.
    pub fn on_import_failed(&mut self, peer: PeerId, range: Range<BlockNumber>, now: Instant) {
        self.import_next = range.start;
        self.exclude(&range, peer, now);
        self.requeue(range);
    }

    pub fn imported(&self) -> BlockNumber {
        self.import_next.saturating_sub(1)
    }

    pub fn in_flight(&self) -> usize {
        self.assigned.len()
    }

    /// Nothing queued, assigned or buffered.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.assigned.is_empty() && self.completed.is_empty()
    }

    pub fn queued_ranges(&self) -> Vec<Range<BlockNumber>> {
        self.queued.iter().cloned().collect()
    }

    /// Drop exclusion entries that expired.
    pub fn prune(&mut self, now: Instant) {
        self.excluded.retain(|_, peers| {
            peers.retain(|_, until| *until > now);
            !peers.is_empty()
        });
    }
}
