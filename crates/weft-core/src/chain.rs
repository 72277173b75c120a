//! In-memory [`ChainBackend`] and a block factory for producing test chains.
//!
//! [`MemoryChain`] keeps every block it imported plus a single state (the
//! state at the blocks whose header commits to its root). It performs the
//! structural checks the network layer relies on: contiguous numbering,
//! parent linkage, body roots and state roots. It is suitable for tests and
//! light tooling; a production node plugs in its own backend.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::debug;

use crate::crypto::{self, AuthorityKey};
use crate::error::ImportError;
use crate::traits::ChainBackend;
use crate::types::{
    body_root, state_root, AuthorityId, Block, BlockHeader, BlockNumber, Hash256, SetId,
    StateChunk, StateEntry, WarpFragment, WarpProof,
};

/// Genesis block committing to `state_root`, finalized by authority set 0.
pub fn genesis_block(state_root: Hash256) -> Block {
    Block {
        header: BlockHeader {
            number: 0,
            parent_hash: Hash256::ZERO,
            state_root,
            body_root: body_root(&[]),
            authority_set_id: 0,
        },
        body: Vec::new(),
        justification: None,
    }
}

struct ChainInner {
    genesis: Block,
    genesis_hash: Hash256,
    /// Imported blocks by number. Gaps exist after a state import.
    blocks: BTreeMap<BlockNumber, Block>,
    by_hash: HashMap<Hash256, BlockNumber>,
    finalized: BlockNumber,
    state: BTreeMap<Vec<u8>, Vec<u8>>,
    state_root: Hash256,
    /// Body items by BLAKE3 content id.
    content: HashMap<Hash256, Vec<u8>>,
}

impl ChainInner {
    fn best(&self) -> &Block {
        self.blocks
            .last_key_value()
            .map(|(_, block)| block)
            .unwrap_or(&self.genesis)
    }

    fn insert(&mut self, block: Block) {
        for item in &block.body {
            self.content.insert(Hash256::blake3(item), item.clone());
        }
        if block.justification.is_some() && block.number() > self.finalized {
            self.finalized = block.number();
        }
        self.by_hash.insert(block.hash(), block.number());
        self.blocks.insert(block.number(), block);
    }
}

/// Thread-safe in-memory chain.
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// Create a chain holding `genesis` and the given state.
    pub fn new(genesis: Block, state: Vec<StateEntry>) -> Self {
        let root = state_root(&state);
        let mut inner = ChainInner {
            genesis: genesis.clone(),
            genesis_hash: genesis.hash(),
            blocks: BTreeMap::new(),
            by_hash: HashMap::new(),
            finalized: 0,
            state: state.into_iter().map(|e| (e.key, e.value)).collect(),
            state_root: root,
            content: HashMap::new(),
        };
        inner.insert(genesis);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Chain whose genesis commits to `state`.
    pub fn with_genesis(state: Vec<StateEntry>) -> Self {
        let genesis = genesis_block(state_root(&state));
        Self::new(genesis, state)
    }

    /// Replace the held state without touching blocks.
    ///
    /// Used by block producers after executing blocks whose headers commit
    /// to the new root.
    pub fn set_state(&self, entries: Vec<StateEntry>) {
        let mut inner = self.inner.write();
        inner.state_root = state_root(&entries);
        inner.state = entries.into_iter().map(|e| (e.key, e.value)).collect();
    }

    pub fn best_number(&self) -> BlockNumber {
        self.inner.read().best().number()
    }

    pub fn finalized_number(&self) -> BlockNumber {
        self.inner.read().finalized
    }

    /// All state entries in key order.
    pub fn state(&self) -> Vec<StateEntry> {
        self.inner
            .read()
            .state
            .iter()
            .map(|(k, v)| StateEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl ChainBackend for MemoryChain {
    fn genesis_hash(&self) -> Hash256 {
        self.inner.read().genesis_hash
    }

    fn best_header(&self) -> BlockHeader {
        self.inner.read().best().header.clone()
    }

    fn finalized_header(&self) -> BlockHeader {
        let inner = self.inner.read();
        match inner.blocks.get(&inner.finalized) {
            Some(block) => block.header.clone(),
            None => inner.best().header.clone(),
        }
    }

    fn header(&self, number: BlockNumber) -> Option<BlockHeader> {
        self.inner.read().blocks.get(&number).map(|b| b.header.clone())
    }

    fn block(&self, number: BlockNumber) -> Option<Block> {
        self.inner.read().blocks.get(&number).cloned()
    }

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        let inner = self.inner.read();
        let number = inner.by_hash.get(hash)?;
        inner.blocks.get(number).cloned()
    }

    fn import_blocks(&self, blocks: Vec<Block>) -> Result<BlockNumber, ImportError> {
        let mut inner = self.inner.write();
        let best = inner.best();
        let mut parent_number = best.number();
        let mut parent_hash = best.hash();

        for block in &blocks {
            if block.number() != parent_number + 1 {
                return Err(ImportError::NonContiguous {
                    expected: parent_number + 1,
                    got: block.number(),
                });
            }
            if block.header.parent_hash != parent_hash {
                return Err(ImportError::UnknownParent(block.number()));
            }
            if !block.is_well_formed() {
                return Err(ImportError::InvalidBody(block.number()));
            }
            parent_number = block.number();
            parent_hash = block.hash();
        }

        let count = blocks.len();
        for block in blocks {
            inner.insert(block);
        }
        debug!(count, best = parent_number, "chain: imported blocks");
        Ok(parent_number)
    }

    fn import_state(&self, block: Block, entries: Vec<StateEntry>) -> Result<(), ImportError> {
        if !block.is_well_formed() {
            return Err(ImportError::InvalidBody(block.number()));
        }
        if state_root(&entries) != block.header.state_root {
            return Err(ImportError::StateRootMismatch);
        }

        let mut inner = self.inner.write();
        let genesis = inner.genesis_hash;
        inner.blocks.retain(|_, b| b.hash() == genesis);
        inner.by_hash.retain(|h, _| *h == genesis);
        inner.finalized = 0;
        inner.state_root = block.header.state_root;
        inner.state = entries.into_iter().map(|e| (e.key, e.value)).collect();
        let number = block.number();
        inner.insert(block);
        inner.finalized = number;
        debug!(number, "chain: imported state");
        Ok(())
    }

    fn state_entries(&self, block: &Hash256, start_key: &[u8], max: usize) -> Option<StateChunk> {
        let inner = self.inner.read();
        let number = inner.by_hash.get(block)?;
        let header = &inner.blocks.get(number)?.header;
        if header.state_root != inner.state_root {
            return None;
        }

        let lower = if start_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(start_key.to_vec())
        };
        let mut range = inner.state.range((lower, Bound::Unbounded));
        let entries: Vec<StateEntry> = range
            .by_ref()
            .take(max)
            .map(|(k, v)| StateEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        let remaining = range.count() as u64;

        Some(StateChunk {
            entries,
            complete: remaining == 0,
            remaining_estimate: remaining,
        })
    }

    fn warp_proof(&self, begin: &Hash256, max_fragments: usize) -> Option<WarpProof> {
        let inner = self.inner.read();
        let begin_number = *inner.by_hash.get(begin)?;
        if begin_number >= inner.finalized {
            return Some(WarpProof {
                fragments: Vec::new(),
                is_finished: true,
            });
        }

        let mut fragments = Vec::new();
        let mut previous_set = inner
            .blocks
            .get(&begin_number)
            .map(|b| b.header.authority_set_id)?;
        for (number, block) in inner.blocks.range(begin_number + 1..=inner.finalized) {
            let enacts_change = block.header.authority_set_id != previous_set;
            previous_set = block.header.authority_set_id;
            if !enacts_change && *number != inner.finalized {
                continue;
            }
            let Some(justification) = &block.justification else {
                continue;
            };
            fragments.push(WarpFragment {
                header: block.header.clone(),
                justification: justification.clone(),
            });
            if fragments.len() >= max_fragments {
                break;
            }
        }

        let is_finished = fragments
            .last()
            .is_some_and(|f| f.header.number == inner.finalized);
        Some(WarpProof {
            fragments,
            is_finished,
        })
    }

    fn content(&self, cid: &Hash256) -> Option<Vec<u8>> {
        self.inner.read().content.get(cid).cloned()
    }
}

/// Produces linear chains signed by a schedule of authority sets.
///
/// Set `n` of the schedule signs blocks while `authority_set_id == n` is the
/// parent's set id. Every set change is justified, as are blocks on the
/// finality period.
pub struct BlockFactory {
    sets: Vec<Vec<AuthorityKey>>,
    set_period: u64,
    finality_period: u64,
    state_root: Option<Hash256>,
}

impl BlockFactory {
    pub fn new(sets: Vec<Vec<AuthorityKey>>) -> Self {
        Self {
            sets,
            set_period: 0,
            finality_period: 1,
            state_root: None,
        }
    }

    /// Enact the next authority set every `period` blocks (0 disables).
    pub fn set_period(mut self, period: u64) -> Self {
        self.set_period = period;
        self
    }

    /// Justify every `period`-th block (0 justifies set changes only).
    pub fn finality_period(mut self, period: u64) -> Self {
        self.finality_period = period;
        self
    }

    /// Commit built headers to this state root instead of the parent's.
    pub fn state_root(mut self, root: Hash256) -> Self {
        self.state_root = Some(root);
        self
    }

    /// Public keys of each set in the schedule, by set id.
    pub fn authority_sets(&self) -> HashMap<SetId, Vec<AuthorityId>> {
        self.sets
            .iter()
            .enumerate()
            .map(|(id, keys)| (id as SetId, keys.iter().map(AuthorityKey::public).collect()))
            .collect()
    }

    /// Build `count` blocks on top of `parent`.
    pub fn build_on(&self, parent: &BlockHeader, count: u64) -> Vec<Block> {
        let mut parent = parent.clone();
        let mut blocks = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let number = parent.number + 1;
            let current = parent.authority_set_id;
            let next = if self.set_period > 0
                && number % self.set_period == 0
                && (current as usize + 1) < self.sets.len()
            {
                current + 1
            } else {
                current
            };

            let body = vec![number.to_le_bytes().to_vec(), format!("block-{number}").into_bytes()];
            let header = BlockHeader {
                number,
                parent_hash: parent.hash(),
                state_root: self.state_root.unwrap_or(parent.state_root),
                body_root: body_root(&body),
                authority_set_id: next,
            };

            let finalize = next != current
                || (self.finality_period > 0 && number % self.finality_period == 0);
            let justification = match self.sets.get(current as usize) {
                Some(keys) if finalize => Some(crypto::justify(&header.hash(), current, keys)),
                _ => None,
            };

            parent = header.clone();
            blocks.push(Block {
                header,
                body,
                justification,
            });
        }
        blocks
    }
}
