//! Chunked download of the state at the warp target.

use libp2p::PeerId;
use serde::Serialize;
use std::collections::BTreeSet;
use weft_core::types::{state_root, Block, StateChunk, StateEntry};

use crate::protocol::StateRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateDownloadProgress {
    /// Estimated completion, 0..=100.
    pub percentage: u8,
    pub entries: u64,
    pub bytes: u64,
}

/// What a chunk did to the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks are needed.
    Progress,
    /// The state is complete and matches the target's root.
    Complete,
    /// The chunk broke key ordering or made no progress.
    Invalid,
    /// Complete, but the root does not match. Everyone who contributed is
    /// suspect; the download has restarted.
    RootMismatch { contributors: Vec<PeerId> },
}

pub struct StateDownload {
    block: Block,
    chunk_size: u32,
    entries: Vec<StateEntry>,
    bytes: u64,
    remaining: u64,
    contributors: BTreeSet<PeerId>,
}

impl StateDownload {
    pub fn new(block: Block, chunk_size: u32) -> Self {
        Self {
            block,
            chunk_size: chunk_size.max(1),
            entries: Vec::new(),
            bytes: 0,
            remaining: 0,
            contributors: BTreeSet::new(),
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn next_request(&self) -> StateRequest {
        StateRequest {
            block: self.block.hash(),
            start_key: self.entries.last().map(|e| e.key.clone()).unwrap_or_default(),
            max_entries: self.chunk_size,
        }
    }

    pub fn on_chunk(&mut self, peer: PeerId, chunk: StateChunk) -> ChunkOutcome {
        if !chunk.complete && chunk.entries.is_empty() {
            return ChunkOutcome::Invalid;
        }
        if chunk.entries.len() > self.chunk_size as usize {
            return ChunkOutcome::Invalid;
        }
        let mut last = self.entries.last().map(|e| e.key.as_slice());
        for entry in &chunk.entries {
            if last.is_some_and(|prev| entry.key.as_slice() <= prev) {
                return ChunkOutcome::Invalid;
            }
            last = Some(entry.key.as_slice());
        }

        self.bytes += chunk
            .entries
            .iter()
            .map(|e| (e.key.len() + e.value.len()) as u64)
            .sum::<u64>();
        self.entries.extend(chunk.entries);
        self.remaining = chunk.remaining_estimate;
        self.contributors.insert(peer);

        if !chunk.complete {
            return ChunkOutcome::Progress;
        }
        if state_root(&self.entries) == self.block.header.state_root {
            return ChunkOutcome::Complete;
        }
        let contributors = std::mem::take(&mut self.contributors).into_iter().collect();
        self.restart();
        ChunkOutcome::RootMismatch { contributors }
    }

    pub fn restart(&mut self) {
        self.entries.clear();
        self.bytes = 0;
        self.remaining = 0;
        self.contributors.clear();
    }

    pub fn progress(&self) -> StateDownloadProgress {
        let have = self.entries.len() as u64;
        let total = have + self.remaining;
        let percentage = if total == 0 { 0 } else { (have * 100 / total).min(100) as u8 };
        StateDownloadProgress {
            percentage,
            entries: have,
            bytes: self.bytes,
        }
    }

    /// Hand over the downloaded entries.
    pub fn finish(self) -> (Block, Vec<StateEntry>) {
        (self.block, self.entries)
    }
}
