//! Collaborator traits consumed by the network layer.
//!
//! - [`ChainBackend`]: local chain storage and import (implemented by the node)
//! - [`SessionInfoProvider`]: authority sets keyed by relay point

use crate::error::{ImportError, SessionError};
use crate::types::{
    AuthorityId, Block, BlockHeader, BlockNumber, Hash256, SetId, StateChunk, StateEntry, WarpProof,
};

/// Local view of the chain, used both to answer peers and to import
/// downloaded data.
///
/// Import methods validate structure (parent linkage, body and state roots)
/// before anything becomes authoritative. Consensus checks are out of scope.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ChainBackend: Send + Sync {
    fn genesis_hash(&self) -> Hash256;

    fn best_header(&self) -> BlockHeader;

    fn finalized_header(&self) -> BlockHeader;

    fn header(&self, number: BlockNumber) -> Option<BlockHeader>;

    fn block(&self, number: BlockNumber) -> Option<Block>;

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;

    /// Import a batch extending the current best block, all or nothing.
    ///
    /// Returns the new best block number.
    fn import_blocks(&self, blocks: Vec<Block>) -> Result<BlockNumber, ImportError>;

    /// Replace local state with `entries` at `block`, making it the new best
    /// and finalized block. Used at the end of warp sync.
    fn import_state(&self, block: Block, entries: Vec<StateEntry>) -> Result<(), ImportError>;

    /// Up to `max` state entries at `block` with keys strictly greater than
    /// `start_key` (or from the first key when `start_key` is empty).
    /// `None` when the state at that block is unavailable.
    fn state_entries(&self, block: &Hash256, start_key: &[u8], max: usize) -> Option<StateChunk>;

    /// Set-change fragments after `begin`. `None` when `begin` is unknown.
    fn warp_proof(&self, begin: &Hash256, max_fragments: usize) -> Option<WarpProof>;

    /// Content-addressed lookup (BLAKE3 id) of a body item.
    fn content(&self, cid: &Hash256) -> Option<Vec<u8>>;
}

/// Runtime/session information cache: authority sets for warp proof checks.
///
/// Errors are split into [`SessionError::Fatal`] (abort the current sync
/// attempt) and [`SessionError::NonFatal`] (retry with another relay point).
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait SessionInfoProvider: Send + Sync {
    fn authorities(&self, relay_point: &Hash256, set_id: SetId) -> Result<Vec<AuthorityId>, SessionError>;
}
