//! Chain synchronization coordinator.
//!
//! Drives the node towards the best chain its peers know about. A fresh
//! node with warp sync enabled proves finality up to a target agreed on by
//! a quorum of peers, downloads the target block and its state, then
//! switches to downloading block ranges. Without warp sync it downloads
//! blocks from genesis. Content fetches by id run as a short detour from
//! idle or block sync.
//!
//! The coordinator performs no I/O. Requests, reputation reports and
//! events are queued as [`SyncAction`]s for the network worker, and every
//! response (or failure, including timeouts) comes back through
//! [`SyncCoordinator::on_response`]. At most one request is in flight per
//! `(peer, phase)`.

pub mod bitswap;
pub mod blocks;
pub mod state;
pub mod warp;

use libp2p::PeerId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use weft_core::error::{BitswapError, NetworkError, OutboundFailure, RequestFailure, SessionError, WarpProofError};
use weft_core::types::{BlockHeader, BlockNumber, Hash256, StateChunk, WarpProof};
use weft_core::{ChainBackend, SessionInfoProvider};

use crate::config::SyncConfig;
use crate::protocol::{
    decode_message, encode_message, BitswapRequest, BitswapResponse, BlockRequest, BlockResponse, StateRequest,
    Status, WarpRequest, BITSWAP_PROTOCOL, BLOCKS_PROTOCOL, STATE_PROTOCOL, WARP_PROTOCOL,
};
use crate::reputation::{
    ReputationChange, BENEFIT_CONTENT, BENEFIT_GOOD_BLOCKS, BENEFIT_GOOD_STATE, BENEFIT_GOOD_WARP_PROOF,
    COST_BAD_BLOCK, COST_BAD_CONTENT, COST_BAD_MESSAGE, COST_BAD_STATE, COST_BAD_WARP_PROOF, COST_EMPTY_RESPONSE,
    COST_REFUSED, COST_TIMEOUT, COST_UNSUPPORTED_PROTOCOL,
};
use crate::session::{SessionCache, DEFAULT_SESSION_CACHE_SIZE};

use self::bitswap::{BitswapFetcher, FetchOutcome};
use self::blocks::{BlockDownload, RangeOutcome};
use self::state::{ChunkOutcome, StateDownload};
use self::warp::{select_target, ProofOutcome, WarpSync};

pub use self::state::StateDownloadProgress;
pub use self::warp::{WarpSyncPhase, WarpSyncProgress, WarpTarget};

/// Kind of sync request. Keys the one-request-per-peer rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SyncPhase {
    WarpProof,
    /// The block a warp proof ended at.
    TargetBlock,
    State,
    Blocks,
    Bitswap,
}

impl SyncPhase {
    pub fn protocol(self) -> &'static str {
        match self {
            SyncPhase::WarpProof => WARP_PROTOCOL,
            SyncPhase::TargetBlock | SyncPhase::Blocks => BLOCKS_PROTOCOL,
            SyncPhase::State => STATE_PROTOCOL,
            SyncPhase::Bitswap => BITSWAP_PROTOCOL,
        }
    }
}

/// What the coordinator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    Idle,
    WarpSync(WarpSyncPhase),
    StateSync,
    BlockSync,
    /// Fetching content by id; returns to the previous mode when done.
    Bitswap,
}

impl SyncMode {
    /// Position along the warp pipeline, `None` outside of it.
    pub fn warp_rank(self) -> Option<u8> {
        match self {
            SyncMode::WarpSync(phase) => Some(phase as u8),
            SyncMode::StateSync => Some(4),
            SyncMode::BlockSync => Some(5),
            SyncMode::Idle | SyncMode::Bitswap => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    /// Caught up with every peer.
    Idle,
    Downloading,
}

/// Snapshot of sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub status: SyncStatus,
    pub mode: SyncMode,
    /// Highest block any peer claims.
    pub best_seen: BlockNumber,
    pub best_imported: BlockNumber,
    pub in_flight: usize,
    /// Warp attempts aborted so far.
    pub attempt: u32,
    pub warp: Option<WarpSyncProgress>,
    pub state: Option<StateDownloadProgress>,
}

/// A peer's chain as reported in its status and announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPeer {
    pub best_number: BlockNumber,
    pub best_hash: Hash256,
    pub finalized_number: BlockNumber,
    pub finalized_hash: Hash256,
}

impl From<&Status> for SyncPeer {
    fn from(status: &Status) -> Self {
        Self {
            best_number: status.best_number,
            best_hash: status.best_hash,
            finalized_number: status.finalized_number,
            finalized_hash: status.finalized_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Blocks(BlockRequest),
    State(StateRequest),
    Warp(WarpRequest),
    Bitswap(BitswapRequest),
}

impl SyncRequest {
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        match self {
            SyncRequest::Blocks(req) => encode_message(req),
            SyncRequest::State(req) => encode_message(req),
            SyncRequest::Warp(req) => encode_message(req),
            SyncRequest::Bitswap(req) => encode_message(req),
        }
    }
}

/// Notable sync transitions, published to event subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ModeChanged(SyncMode),
    BlocksImported { best: BlockNumber, count: usize },
    /// State at the warp target was imported.
    StateImported { number: BlockNumber },
    /// The session provider failed fatally; warp sync starts over.
    WarpSyncAborted { attempt: u32, reason: String },
}

/// Work for the network worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Send `request` to `peer`; the outcome comes back via `on_response`.
    Request {
        peer: PeerId,
        phase: SyncPhase,
        request: SyncRequest,
    },
    /// Adjust a peer's reputation.
    Report { peer: PeerId, change: ReputationChange },
    /// Publish a sync event.
    Event(SyncEvent),
    /// A content fetch finished.
    ContentFetched {
        cid: Hash256,
        result: Result<Vec<u8>, BitswapError>,
    },
}

pub struct SyncCoordinator {
    config: SyncConfig,
    chain: Arc<dyn ChainBackend>,
    sessions: SessionCache,
    mode: SyncMode,
    /// Where a bitswap detour returns to.
    resume: SyncMode,
    /// Connected peers still owing a status.
    pending: BTreeSet<PeerId>,
    peers: BTreeMap<PeerId, SyncPeer>,
    /// Outstanding requests and when they were sent.
    in_flight: HashMap<(PeerId, SyncPhase), Instant>,
    blocks: BlockDownload,
    warp: WarpSync,
    state: Option<StateDownload>,
    bitswap: BitswapFetcher,
    attempt: u32,
    actions: Vec<SyncAction>,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, chain: Arc<dyn ChainBackend>, sessions: Arc<dyn SessionInfoProvider>) -> Self {
        let best = chain.best_header().number;
        let mode = if config.warp_sync {
            SyncMode::WarpSync(WarpSyncPhase::AwaitingPeers)
        } else {
            SyncMode::Idle
        };
        info!(?mode, best, "sync: starting");
        Self {
            blocks: BlockDownload::new(config.block_range_size, config.range_exclusion(), best),
            warp: WarpSync::new(chain.finalized_header(), config.warp_retry_cooldown()),
            sessions: SessionCache::new(sessions, DEFAULT_SESSION_CACHE_SIZE),
            config,
            chain,
            mode,
            resume: SyncMode::Idle,
            pending: BTreeSet::new(),
            peers: BTreeMap::new(),
            in_flight: HashMap::new(),
            state: None,
            bitswap: BitswapFetcher::default(),
            attempt: 0,
            actions: Vec::new(),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn drain_actions(&mut self) -> Vec<SyncAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn is_in_flight(&self, peer: &PeerId, phase: SyncPhase) -> bool {
        self.in_flight.contains_key(&(*peer, phase))
    }

    // ---- Peer lifecycle ----

    /// A connection opened; the peer is usable once its status arrives.
    pub fn on_peer_connected(&mut self, peer: PeerId) {
        if !self.peers.contains_key(&peer) {
            self.pending.insert(peer);
        }
    }

    /// The peer's status handshake completed (genesis already checked).
    pub fn on_peer_status(&mut self, peer: PeerId, status: &Status, now: Instant) {
        self.pending.remove(&peer);
        if status.best_number == BlockNumber::MAX || status.finalized_number > status.best_number {
            warn!(%peer, best = status.best_number, finalized = status.finalized_number, "sync: implausible status");
            self.report(peer, COST_BAD_MESSAGE);
            return;
        }
        debug!(%peer, best = status.best_number, finalized = status.finalized_number, "sync: peer status");
        self.peers.insert(peer, SyncPeer::from(status));
        self.advance(now);
    }

    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        self.pending.remove(peer);
        if self.peers.remove(peer).is_none() {
            return;
        }
        self.in_flight.retain(|(p, _), _| p != peer);
        self.blocks.on_peer_disconnected(peer);
        self.bitswap.on_peer_disconnected(peer);
    }

    /// A peer announced a new block; it may now be ahead of us.
    pub fn on_block_announce(&mut self, peer: PeerId, header: &BlockHeader, now: Instant) {
        if header.number == BlockNumber::MAX {
            warn!(%peer, "sync: implausible block announcement");
            self.report(peer, COST_BAD_MESSAGE);
            return;
        }
        let Some(known) = self.peers.get_mut(&peer) else {
            return;
        };
        if header.number > known.best_number {
            known.best_number = header.number;
            known.best_hash = header.hash();
            trace!(%peer, number = header.number, "sync: peer best advanced");
        }
        self.advance(now);
    }

    // ---- Requests ----

    /// No request of `phase` is outstanding to `peer`, nor one on the same
    /// wire protocol that a new request would supersede.
    fn can_issue(&self, peer: &PeerId, phase: SyncPhase) -> bool {
        !self
            .in_flight
            .keys()
            .any(|(p, ph)| p == peer && ph.protocol() == phase.protocol())
    }

    fn phase_in_flight(&self, phase: SyncPhase) -> bool {
        self.in_flight.keys().any(|(_, ph)| *ph == phase)
    }

    fn issue(&mut self, peer: PeerId, phase: SyncPhase, request: SyncRequest, now: Instant) -> bool {
        if !self.can_issue(&peer, phase) {
            return false;
        }
        trace!(%peer, ?phase, "sync: request");
        self.in_flight.insert((peer, phase), now);
        self.actions.push(SyncAction::Request { peer, phase, request });
        true
    }

    fn report(&mut self, peer: PeerId, change: ReputationChange) {
        self.actions.push(SyncAction::Report { peer, change });
    }

    fn set_mode(&mut self, mode: SyncMode) {
        if self.mode == mode {
            return;
        }
        info!(from = ?self.mode, to = ?mode, "sync: mode changed");
        self.mode = mode;
        self.actions.push(SyncAction::Event(SyncEvent::ModeChanged(mode)));
    }

    /// Best eligible peer for a warp-pipeline request: finalized at least
    /// `min_finalized`, not cooling down, highest best block first.
    fn warp_peer(&self, phase: SyncPhase, min_finalized: BlockNumber, now: Instant) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(id, p)| {
                p.finalized_number >= min_finalized && !self.warp.is_cooling(id, now) && self.can_issue(id, phase)
            })
            .max_by(|a, b| a.1.best_number.cmp(&b.1.best_number).then(b.0.cmp(a.0)))
            .map(|(id, _)| *id)
    }

    /// Peers by best block, highest first.
    fn ranked_peers(&self, phase: SyncPhase) -> Vec<(PeerId, BlockNumber)> {
        let mut peers: Vec<(PeerId, BlockNumber)> = self
            .peers
            .iter()
            .filter(|(id, _)| self.can_issue(id, phase))
            .map(|(id, p)| (*id, p.best_number))
            .collect();
        peers.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        peers
    }

    // ---- Driving ----

    /// Periodic housekeeping plus any requests that can go out now.
    pub fn tick(&mut self, now: Instant) {
        self.blocks.prune(now);
        self.advance(now);
    }

    fn advance(&mut self, now: Instant) {
        self.start_bitswap();
        match self.mode {
            SyncMode::Idle => self.maybe_start_block_sync(now),
            SyncMode::WarpSync(phase) => self.drive_warp(phase, now),
            SyncMode::StateSync => self.request_state(now),
            SyncMode::BlockSync => self.schedule_blocks(now),
            SyncMode::Bitswap => self.drive_bitswap(now),
        }
    }

    fn maybe_start_block_sync(&mut self, now: Instant) {
        let best = self.chain.best_header().number;
        if self.peers.values().any(|p| p.best_number > best) {
            self.blocks.reset(best);
            self.set_mode(SyncMode::BlockSync);
            self.schedule_blocks(now);
        }
    }

    fn schedule_blocks(&mut self, now: Instant) {
        let peers = self.ranked_peers(SyncPhase::Blocks);
        for (peer, range) in self.blocks.schedule(&peers, now) {
            let request = BlockRequest {
                from: range.start,
                count: u32::try_from(range.end.saturating_sub(range.start)).unwrap_or(u32::MAX),
            };
            self.issue(peer, SyncPhase::Blocks, SyncRequest::Blocks(request), now);
        }
    }

    fn drive_warp(&mut self, phase: WarpSyncPhase, now: Instant) {
        match phase {
            WarpSyncPhase::AwaitingPeers => {
                if !self.warp.can_start(now) {
                    return;
                }
                let Some(target) = select_target(&self.peers, self.config.warp_quorum) else {
                    return;
                };
                let best = self.chain.best_header().number;
                if target.number <= best {
                    info!(target = target.number, best, "sync: already past warp target");
                    self.blocks.reset(best);
                    self.set_mode(SyncMode::BlockSync);
                    self.schedule_blocks(now);
                    return;
                }
                self.warp.set_target(target);
                self.set_mode(SyncMode::WarpSync(WarpSyncPhase::DownloadingProofs));
                self.request_proof(now);
            }
            WarpSyncPhase::DownloadingProofs => self.request_proof(now),
            WarpSyncPhase::DownloadingTargetBlock => self.request_target_block(now),
            WarpSyncPhase::ImportingState => {}
        }
    }

    fn request_proof(&mut self, now: Instant) {
        if self.phase_in_flight(SyncPhase::WarpProof) {
            return;
        }
        let Some(target) = self.warp.target() else {
            return;
        };
        if let Some(peer) = self.warp_peer(SyncPhase::WarpProof, target.number, now) {
            let request = SyncRequest::Warp(self.warp.proof_request());
            self.issue(peer, SyncPhase::WarpProof, request, now);
        }
    }

    fn request_target_block(&mut self, now: Instant) {
        if self.phase_in_flight(SyncPhase::TargetBlock) {
            return;
        }
        let (Some(target), Some(request)) = (self.warp.target(), self.warp.target_request()) else {
            return;
        };
        if let Some(peer) = self.warp_peer(SyncPhase::TargetBlock, target.number, now) {
            self.issue(peer, SyncPhase::TargetBlock, SyncRequest::Blocks(request), now);
        }
    }

    fn request_state(&mut self, now: Instant) {
        if self.phase_in_flight(SyncPhase::State) {
            return;
        }
        let Some(download) = &self.state else {
            return;
        };
        let request = download.next_request();
        if let Some(peer) = self.warp_peer(SyncPhase::State, download.block().number(), now) {
            self.issue(peer, SyncPhase::State, SyncRequest::State(request), now);
        }
    }

    // ---- Responses ----

    /// Outcome of a request issued through [`SyncAction::Request`].
    ///
    /// Responses to requests that are no longer outstanding are ignored.
    pub fn on_response(
        &mut self,
        peer: PeerId,
        phase: SyncPhase,
        result: Result<Vec<u8>, RequestFailure>,
        now: Instant,
    ) {
        if self.in_flight.remove(&(peer, phase)).is_none() {
            trace!(%peer, ?phase, "sync: ignoring stale response");
            return;
        }
        match result {
            Err(failure) => self.on_failure(peer, phase, failure, now),
            Ok(bytes) => match phase {
                SyncPhase::Blocks => self.on_blocks(peer, &bytes, now),
                SyncPhase::WarpProof => self.on_warp_proof(peer, &bytes, now),
                SyncPhase::TargetBlock => self.on_target_block(peer, &bytes, now),
                SyncPhase::State => self.on_state_chunk(peer, &bytes, now),
                SyncPhase::Bitswap => self.on_content(peer, &bytes),
            },
        }
        self.advance(now);
    }

    fn on_failure(&mut self, peer: PeerId, phase: SyncPhase, failure: RequestFailure, now: Instant) {
        debug!(%peer, ?phase, error = %failure, "sync: request failed");
        let timeout = failure == RequestFailure::Network(OutboundFailure::Timeout);
        let consecutive = match phase {
            SyncPhase::Blocks => self.blocks.on_failure(&peer, timeout, now),
            SyncPhase::WarpProof | SyncPhase::TargetBlock | SyncPhase::State => {
                self.warp.cool_down(peer, now);
                1
            }
            SyncPhase::Bitswap => {
                self.on_fetch_answer(peer, None);
                1
            }
        };
        if let Some(change) = failure_cost(&failure, consecutive) {
            self.report(peer, change);
        }
    }

    fn on_blocks(&mut self, peer: PeerId, bytes: &[u8], now: Instant) {
        let Some(BlockResponse { blocks }) = decode_message(bytes) else {
            self.blocks.on_failure(&peer, false, now);
            self.report(peer, COST_BAD_MESSAGE);
            return;
        };
        match self.blocks.on_blocks(&peer, blocks, now) {
            RangeOutcome::Complete | RangeOutcome::Partial { .. } => self.report(peer, BENEFIT_GOOD_BLOCKS),
            RangeOutcome::Empty => self.report(peer, COST_EMPTY_RESPONSE),
            RangeOutcome::Invalid => {
                warn!(%peer, "sync: peer sent invalid blocks");
                self.report(peer, COST_BAD_BLOCK);
            }
            RangeOutcome::Unexpected => {}
        }
        self.import_ready(now);
    }

    /// Import every buffered range that continues the local chain.
    fn import_ready(&mut self, now: Instant) {
        let mut count = 0;
        let mut best = None;
        while let Some((peer, blocks)) = self.blocks.next_ready() {
            let range: Range<BlockNumber> = match (blocks.first(), blocks.last()) {
                (Some(first), Some(last)) => first.number()..last.number().saturating_add(1),
                _ => continue,
            };
            let len = blocks.len();
            match self.chain.import_blocks(blocks) {
                Ok(number) => {
                    count += len;
                    best = Some(number);
                }
                Err(e) => {
                    warn!(%peer, start = range.start, error = %e, "sync: import rejected range");
                    self.report(peer, COST_BAD_BLOCK);
                    self.blocks.on_import_failed(peer, range, now);
                    break;
                }
            }
        }
        if let Some(best) = best {
            info!(best, count, "sync: imported blocks");
            self.actions
                .push(SyncAction::Event(SyncEvent::BlocksImported { best, count }));
        }
    }

    fn on_warp_proof(&mut self, peer: PeerId, bytes: &[u8], now: Instant) {
        if self.mode != SyncMode::WarpSync(WarpSyncPhase::DownloadingProofs) {
            return;
        }
        let Some(proof) = decode_message::<WarpProof>(bytes) else {
            self.warp.cool_down(peer, now);
            self.report(peer, COST_BAD_MESSAGE);
            return;
        };
        match self.warp.import_proof(peer, &proof, bytes.len(), &mut self.sessions) {
            Ok(ProofOutcome::Partial) => self.report(peer, BENEFIT_GOOD_WARP_PROOF),
            Ok(ProofOutcome::Finished) => {
                self.report(peer, BENEFIT_GOOD_WARP_PROOF);
                self.set_mode(SyncMode::WarpSync(WarpSyncPhase::DownloadingTargetBlock));
            }
            Ok(ProofOutcome::AwaitingConfirmation) => {
                // Ask someone else for the same proof.
                self.warp.cool_down(peer, now);
            }
            Err(WarpProofError::Session(SessionError::Fatal(e))) => {
                self.abort_warp(format!("session provider failed: {e}"), now);
            }
            Err(WarpProofError::Session(e)) => {
                // Our provider lacks the data; try another peer's proof.
                debug!(%peer, error = %e, "sync: warp proof unverifiable for now");
                self.warp.cool_down(peer, now);
            }
            Err(e) => {
                warn!(%peer, error = %e, "sync: invalid warp proof");
                self.warp.cool_down(peer, now);
                self.report(peer, COST_BAD_WARP_PROOF);
            }
        }
    }

    fn abort_warp(&mut self, reason: String, now: Instant) {
        error!(attempt = self.attempt, %reason, "sync: warp sync aborted");
        self.actions.push(SyncAction::Event(SyncEvent::WarpSyncAborted {
            attempt: self.attempt,
            reason,
        }));
        self.attempt += 1;
        self.state = None;
        self.warp.restart(self.chain.finalized_header(), now);
        self.set_mode(SyncMode::WarpSync(WarpSyncPhase::AwaitingPeers));
    }

    fn on_target_block(&mut self, peer: PeerId, bytes: &[u8], now: Instant) {
        if self.mode != SyncMode::WarpSync(WarpSyncPhase::DownloadingTargetBlock) {
            return;
        }
        let accepted = decode_message::<BlockResponse>(bytes)
            .is_some_and(|resp| self.warp.import_target_block(resp.blocks, bytes.len()));
        if !accepted {
            warn!(%peer, "sync: bad warp target block");
            self.warp.cool_down(peer, now);
            self.report(peer, COST_BAD_BLOCK);
            return;
        }
        self.set_mode(SyncMode::WarpSync(WarpSyncPhase::ImportingState));
        if let Some(block) = self.warp.take_target_block() {
            let chunk = u32::try_from(self.config.state_chunk_size).unwrap_or(u32::MAX);
            self.state = Some(StateDownload::new(block, chunk));
            self.set_mode(SyncMode::StateSync);
        }
    }

    fn on_state_chunk(&mut self, peer: PeerId, bytes: &[u8], now: Instant) {
        let Some(download) = self.state.as_mut() else {
            return;
        };
        let Some(chunk) = decode_message::<StateChunk>(bytes) else {
            self.warp.cool_down(peer, now);
            self.report(peer, COST_BAD_MESSAGE);
            return;
        };
        match download.on_chunk(peer, chunk) {
            ChunkOutcome::Progress => self.report(peer, BENEFIT_GOOD_STATE),
            ChunkOutcome::Complete => {
                self.report(peer, BENEFIT_GOOD_STATE);
                self.finish_state();
            }
            ChunkOutcome::Invalid => {
                warn!(%peer, "sync: invalid state chunk");
                self.warp.cool_down(peer, now);
                self.report(peer, COST_BAD_STATE);
            }
            ChunkOutcome::RootMismatch { contributors } => {
                warn!(peers = contributors.len(), "sync: state root mismatch, restarting download");
                for contributor in contributors {
                    self.warp.cool_down(contributor, now);
                    self.report(contributor, COST_BAD_STATE);
                }
            }
        }
    }

    fn finish_state(&mut self) {
        let Some(download) = self.state.take() else {
            return;
        };
        let (block, entries) = download.finish();
        let number = block.number();
        let entry_count = entries.len();
        match self.chain.import_state(block.clone(), entries) {
            Ok(()) => {
                info!(number, entries = entry_count, "sync: state imported");
                self.actions
                    .push(SyncAction::Event(SyncEvent::StateImported { number }));
                self.blocks.reset(number);
                self.set_mode(SyncMode::BlockSync);
            }
            Err(e) => {
                error!(number, error = %e, "sync: state import failed, downloading again");
                let chunk = u32::try_from(self.config.state_chunk_size).unwrap_or(u32::MAX);
                self.state = Some(StateDownload::new(block, chunk));
            }
        }
    }

    // ---- Content ----

    /// Fetch content by id. The result arrives as
    /// [`SyncAction::ContentFetched`], immediately for local hits and when
    /// there is nobody to ask.
    pub fn fetch_content(&mut self, cid: Hash256, now: Instant) {
        if let Some(data) = self.chain.content(&cid) {
            self.actions.push(SyncAction::ContentFetched { cid, result: Ok(data) });
            return;
        }
        if self.peers.is_empty() {
            self.actions.push(SyncAction::ContentFetched {
                cid,
                result: Err(BitswapError::NoPeers),
            });
            return;
        }
        self.bitswap.enqueue(cid);
        self.advance(now);
    }

    /// Begin the next queued fetch when the current mode allows a detour.
    fn start_bitswap(&mut self) {
        if !matches!(self.mode, SyncMode::Idle | SyncMode::BlockSync) || self.bitswap.is_active() {
            return;
        }
        if let Some(cid) = self.bitswap.start_next() {
            debug!(cid = %cid.short(), "sync: fetching content");
            self.resume = self.mode;
            self.set_mode(SyncMode::Bitswap);
        }
    }

    fn drive_bitswap(&mut self, now: Instant) {
        if !self.bitswap.is_active() {
            self.set_mode(self.resume);
            return;
        }
        if self.bitswap.current_peer().is_some() {
            return;
        }
        let candidates: Vec<PeerId> = self
            .ranked_peers(SyncPhase::Bitswap)
            .into_iter()
            .map(|(peer, _)| peer)
            .collect();
        match self.bitswap.next_request(&candidates) {
            Some((peer, request)) => {
                self.issue(peer, SyncPhase::Bitswap, SyncRequest::Bitswap(request), now);
            }
            None => self.finish_fetch(Err(BitswapError::NotFound)),
        }
    }

    fn on_content(&mut self, peer: PeerId, bytes: &[u8]) {
        match decode_message::<BitswapResponse>(bytes) {
            Some(resp) => self.on_fetch_answer(peer, resp.data),
            None => {
                self.report(peer, COST_BAD_MESSAGE);
                self.on_fetch_answer(peer, None);
            }
        }
    }

    fn on_fetch_answer(&mut self, peer: PeerId, data: Option<Vec<u8>>) {
        match self.bitswap.on_response(&peer, data) {
            Some(FetchOutcome::Found(data)) => {
                self.report(peer, BENEFIT_CONTENT);
                self.finish_fetch(Ok(data));
            }
            Some(FetchOutcome::Mismatch) => {
                warn!(%peer, "sync: content does not match its id");
                self.report(peer, COST_BAD_CONTENT);
            }
            Some(FetchOutcome::Missing) | None => {}
        }
    }

    fn finish_fetch(&mut self, result: Result<Vec<u8>, BitswapError>) {
        if let Some(cid) = self.bitswap.finish() {
            debug!(cid = %cid.short(), found = result.is_ok(), "sync: content fetch finished");
            self.actions.push(SyncAction::ContentFetched { cid, result });
        }
        if self.mode == SyncMode::Bitswap {
            self.set_mode(self.resume);
        }
    }

    // ---- Status ----

    pub fn status(&self) -> SyncState {
        let best_imported = self.chain.best_header().number;
        let best_seen = self
            .peers
            .values()
            .map(|p| p.best_number)
            .max()
            .unwrap_or(0)
            .max(best_imported);
        let caught_up = best_seen <= best_imported && self.blocks.is_idle();
        let status = match self.mode {
            SyncMode::Idle => SyncStatus::Idle,
            SyncMode::BlockSync | SyncMode::Bitswap if caught_up => SyncStatus::Idle,
            _ => SyncStatus::Downloading,
        };
        SyncState {
            status,
            mode: self.mode,
            best_seen,
            best_imported,
            in_flight: self.in_flight.len(),
            attempt: self.attempt,
            warp: matches!(self.mode, SyncMode::WarpSync(_)).then(|| self.warp.progress()),
            state: self.state.as_ref().map(StateDownload::progress),
        }
    }
}

/// Penalty for a failed request. Timeouts grow with repetition.
fn failure_cost(failure: &RequestFailure, consecutive: u32) -> Option<ReputationChange> {
    match failure {
        RequestFailure::Network(OutboundFailure::Timeout) => Some(COST_TIMEOUT.scaled(consecutive)),
        RequestFailure::Refused => Some(COST_REFUSED),
        RequestFailure::UnknownProtocol | RequestFailure::Network(OutboundFailure::UnsupportedProtocols) => {
            Some(COST_UNSUPPORTED_PROTOCOL)
        }
        RequestFailure::NotConnected
        | RequestFailure::Obsolete
        | RequestFailure::Network(OutboundFailure::DialFailure | OutboundFailure::ConnectionClosed) => None,
    }
}
