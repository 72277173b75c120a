//! Warp sync: jump to a finalized block agreed on by a quorum of peers by
//! verifying a chain of authority-set handoffs instead of every block.
//!
//! The proof is checked fragment by fragment against the authority set in
//! force. Nothing is committed until a whole proof verifies, so a bad proof
//! leaves the download exactly where it was.

use libp2p::PeerId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use weft_core::crypto::verify_justification;
use weft_core::error::{SessionError, WarpProofError};
use weft_core::types::{Block, BlockHeader, BlockNumber, Hash256, SetId, WarpProof};

use crate::protocol::{BlockRequest, WarpRequest};
use crate::session::SessionCache;

use super::SyncPeer;

/// Phases of a warp-sync attempt, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WarpSyncPhase {
    /// Waiting for enough peers to agree on a finalized target.
    AwaitingPeers,
    DownloadingProofs,
    DownloadingTargetBlock,
    /// Target block verified; its state is about to be downloaded.
    ImportingState,
}

/// Progress of the current warp-sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarpSyncProgress {
    pub phase: WarpSyncPhase,
    pub target: Option<BlockNumber>,
    /// Last block whose finality has been proven.
    pub proven: BlockNumber,
    pub fragments: usize,
    pub bytes: u64,
}

/// What an accepted proof did to the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofOutcome {
    /// Verified and applied; more proof is needed to reach the target.
    Partial,
    /// Verified and applied; the target header is proven.
    Finished,
    /// Verified, but it ends past the agreed target. Nothing was applied:
    /// the same proof must come from another peer first.
    AwaitingConfirmation,
}

/// The finalized block a quorum of peers agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpTarget {
    pub number: BlockNumber,
    pub hash: Hash256,
}

/// Most-agreed finalized block among `peers`, if at least `quorum` peers
/// report exactly it. Ties go to the higher block.
pub fn select_target(peers: &BTreeMap<PeerId, SyncPeer>, quorum: usize) -> Option<WarpTarget> {
    let mut votes: HashMap<(BlockNumber, Hash256), usize> = HashMap::new();
    for peer in peers.values() {
        *votes.entry((peer.finalized_number, peer.finalized_hash)).or_default() += 1;
    }
    votes
        .into_iter()
        .filter(|(_, count)| *count >= quorum.max(1))
        .max_by_key(|((number, hash), count)| (*count, *number, *hash))
        .map(|((number, hash), _)| WarpTarget { number, hash })
}

pub struct WarpSync {
    phase: WarpSyncPhase,
    cooldown: Duration,
    target: Option<WarpTarget>,
    /// Last proven header: proofs are requested from here.
    begin: BlockHeader,
    /// Set that signs the block after `begin`.
    current_set: SetId,
    fragments: usize,
    bytes: u64,
    target_header: Option<BlockHeader>,
    target_block: Option<Block>,
    /// A proof that ended past the target: who sent it and where it ended.
    unconfirmed: Option<(PeerId, Hash256)>,
    /// Peers that served a bad proof or block, until the cooldown ends.
    cooling: HashMap<PeerId, Instant>,
    /// No new attempt before this instant.
    retry_at: Option<Instant>,
}

impl WarpSync {
    /// Start from the local finalized header.
    pub fn new(finalized: BlockHeader, cooldown: Duration) -> Self {
        Self {
            phase: WarpSyncPhase::AwaitingPeers,
            cooldown,
            current_set: finalized.authority_set_id,
            begin: finalized,
            target: None,
            fragments: 0,
            bytes: 0,
            target_header: None,
            target_block: None,
            unconfirmed: None,
            cooling: HashMap::new(),
            retry_at: None,
        }
    }

    /// Abandon the attempt and start over from `finalized` after the cooldown.
    pub fn restart(&mut self, finalized: BlockHeader, now: Instant) {
        let cooling = std::mem::take(&mut self.cooling);
        *self = Self::new(finalized, self.cooldown);
        self.cooling = cooling;
        self.retry_at = Some(now + self.cooldown);
    }

    pub fn phase(&self) -> WarpSyncPhase {
        self.phase
    }

    pub fn target(&self) -> Option<WarpTarget> {
        self.target
    }

    pub fn can_start(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    pub fn begin_number(&self) -> BlockNumber {
        self.begin.number
    }

    pub fn set_target(&mut self, target: WarpTarget) {
        info!(number = target.number, hash = %target.hash.short(), "warp: target selected");
        self.target = Some(target);
        self.phase = WarpSyncPhase::DownloadingProofs;
    }

    pub fn progress(&self) -> WarpSyncProgress {
        WarpSyncProgress {
            phase: self.phase,
            target: self.target.map(|t| t.number),
            proven: self.begin.number,
            fragments: self.fragments,
            bytes: self.bytes,
        }
    }

    pub fn proof_request(&self) -> WarpRequest {
        WarpRequest {
            begin: self.begin.hash(),
        }
    }

    pub fn target_request(&self) -> Option<BlockRequest> {
        self.target.map(|t| BlockRequest { from: t.number, count: 1 })
    }

    pub fn cool_down(&mut self, peer: PeerId, now: Instant) {
        self.cooling.insert(peer, now + self.cooldown);
    }

    pub fn is_cooling(&self, peer: &PeerId, now: Instant) -> bool {
        self.cooling.get(peer).is_some_and(|until| *until > now)
    }

    /// Verify the next proof from `source` and, if it checks out, advance
    /// past it.
    ///
    /// A proof ending beyond the quorum's target is only trusted once a
    /// second peer's proof ends at the same block.
    pub fn import_proof(
        &mut self,
        source: PeerId,
        proof: &WarpProof,
        size: usize,
        sessions: &mut SessionCache,
    ) -> Result<ProofOutcome, WarpProofError> {
        let Some(target) = self.target else {
            return Err(WarpProofError::TargetMismatch);
        };
        let Some(last) = proof.fragments.last() else {
            return Err(WarpProofError::Empty);
        };

        let mut set = self.current_set;
        let mut previous = self.begin.number;
        for fragment in &proof.fragments {
            let header = &fragment.header;
            if header.number <= previous {
                return Err(WarpProofError::NotAscending(header.number));
            }
            if fragment.justification.set_id != set {
                return Err(WarpProofError::SetMismatch {
                    number: header.number,
                    expected: set,
                    got: fragment.justification.set_id,
                });
            }
            let hash = header.hash();
            let authorities = authorities_for(sessions, header, set)?;
            verify_justification(&hash, &fragment.justification, &authorities).map_err(|source| {
                WarpProofError::Justification {
                    number: header.number,
                    source,
                }
            })?;
            set = header.authority_set_id;
            previous = header.number;
        }

        let finished = proof.is_finished || last.header.number >= target.number;
        if finished && last.header.hash() != target.hash {
            if last.header.number <= target.number {
                return Err(WarpProofError::TargetMismatch);
            }
            let hash = last.header.hash();
            let confirmed = self
                .unconfirmed
                .is_some_and(|(first, first_hash)| first != source && first_hash == hash);
            if !confirmed {
                debug!(%source, target = target.number, end = last.header.number, "warp: proof ends past target, asking another peer");
                self.unconfirmed = Some((source, hash));
                return Ok(ProofOutcome::AwaitingConfirmation);
            }
            // Finality moved on while we were syncing; two peers prove the newer block.
            debug!(old = target.number, new = last.header.number, "warp: target advanced");
            self.target = Some(WarpTarget {
                number: last.header.number,
                hash,
            });
        }

        self.current_set = set;
        self.begin = last.header.clone();
        self.fragments += proof.fragments.len();
        self.bytes += size as u64;
        debug!(proven = self.begin.number, fragments = self.fragments, "warp: proof verified");
        self.unconfirmed = None;
        if !finished {
            return Ok(ProofOutcome::Partial);
        }
        self.target_header = Some(last.header.clone());
        self.phase = WarpSyncPhase::DownloadingTargetBlock;
        Ok(ProofOutcome::Finished)
    }

    /// Accept the target block if it is the one the proof finalized.
    pub fn import_target_block(&mut self, mut blocks: Vec<Block>, size: usize) -> bool {
        let Some(expected) = &self.target_header else {
            return false;
        };
        if blocks.len() != 1 {
            return false;
        }
        let block = blocks.remove(0);
        if block.header != *expected || !block.is_well_formed() {
            return false;
        }
        self.bytes += size as u64;
        self.target_block = Some(block);
        self.phase = WarpSyncPhase::ImportingState;
        true
    }

    /// The verified target block, once downloaded.
    pub fn take_target_block(&mut self) -> Option<Block> {
        self.target_block.take()
    }
}

/// Authorities of `set`, asking at the fragment itself and then at its
/// parent when the first relay point is unknown.
fn authorities_for(
    sessions: &mut SessionCache,
    header: &BlockHeader,
    set: SetId,
) -> Result<Vec<weft_core::types::AuthorityId>, SessionError> {
    match sessions.authorities(&header.hash(), set) {
        Err(SessionError::NonFatal(e)) => {
            debug!(number = header.number, error = %e, "warp: retrying session lookup at parent");
            sessions.authorities(&header.parent_hash, set)
        }
        other => other,
    }
}
