//! Chain primitives moved between peers: headers, blocks, state, warp proofs.
//!
//! These types carry only what the network layer needs to sequence and
//! validate downloads. Consensus rules live outside this crate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Block height.
pub type BlockNumber = u64;

/// Identifier of an authority set (incremented on every set change).
pub type SetId = u64;

/// A 32-byte hash value.
///
/// Header hashes are double SHA-256; body, state and content ids are BLAKE3.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Parent of the genesis block.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// BLAKE3 digest of `data`. Used for content ids.
    pub fn blake3(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Block header.
///
/// `authority_set_id` names the set that finalizes the *next* block: a header
/// whose id differs from its parent's enacts an authority set change.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub number: BlockNumber,
    pub parent_hash: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
    pub authority_set_id: SetId,
}

impl BlockHeader {
    /// Serialized size used as the hashing pre-image.
    pub const HASH_SIZE: usize = 8 + 32 + 32 + 32 + 8;

    /// Double SHA-256 over a fixed little-endian layout.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.number.to_le_bytes());
        data.extend_from_slice(self.parent_hash.as_bytes());
        data.extend_from_slice(self.state_root.as_bytes());
        data.extend_from_slice(self.body_root.as_bytes());
        data.extend_from_slice(&self.authority_set_id.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// Signatures of an authority set over a header hash.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Justification {
    /// The set that produced the signatures.
    pub set_id: SetId,
    /// `(signer, 64-byte ed25519 signature)` pairs.
    pub signatures: Vec<(AuthorityId, Vec<u8>)>,
}

/// Raw ed25519 public key of an authority.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct AuthorityId(pub [u8; 32]);

/// A full block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Opaque extrinsics.
    pub body: Vec<Vec<u8>>,
    pub justification: Option<Justification>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Whether the body matches the root committed in the header.
    pub fn is_well_formed(&self) -> bool {
        body_root(&self.body) == self.header.body_root
    }
}

/// Commitment to an ordered block body: BLAKE3 over per-item BLAKE3 digests.
pub fn body_root(body: &[Vec<u8>]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(body.len() as u64).to_le_bytes());
    for item in body {
        hasher.update(blake3::hash(item).as_bytes());
    }
    Hash256(hasher.finalize().into())
}

/// A single key/value pair of the state trie.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct StateEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Commitment to a full state: BLAKE3 over the key-sorted entries.
///
/// Entries are sorted internally, so callers may pass them in any order.
pub fn state_root(entries: &[StateEntry]) -> Hash256 {
    let mut sorted: Vec<&StateEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(sorted.len() as u64).to_le_bytes());
    for entry in sorted {
        hasher.update(&(entry.key.len() as u64).to_le_bytes());
        hasher.update(&entry.key);
        hasher.update(&(entry.value.len() as u64).to_le_bytes());
        hasher.update(&entry.value);
    }
    Hash256(hasher.finalize().into())
}

/// A contiguous slice of state, in ascending key order.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct StateChunk {
    pub entries: Vec<StateEntry>,
    /// No entries exist after the last one in this chunk.
    pub complete: bool,
    /// Server's estimate of how many entries remain after this chunk.
    pub remaining_estimate: u64,
}

/// A finalized header that enacts an authority set change, with its proof.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct WarpFragment {
    pub header: BlockHeader,
    pub justification: Justification,
}

/// Sequence of set-change fragments from a starting block towards the tip.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct WarpProof {
    pub fragments: Vec<WarpFragment>,
    /// The last fragment is the latest finalized block the server knows.
    pub is_finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            parent_hash: Hash256::ZERO,
            state_root: Hash256::ZERO,
            body_root: body_root(&[]),
            authority_set_id: 0,
        }
    }

    #[test]
    fn hash256_display_hex() {
        let h = Hash256([0xAB; 32]);
        let s = format!("{h}");
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
        assert_eq!(h.short(), "abababab");
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn header_hash_commits_to_every_field() {
        let base = header(7);
        let mut other = base.clone();
        other.authority_set_id = 1;
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.number = 8;
        assert_ne!(base.hash(), other.hash());

        assert_eq!(base.hash(), header(7).hash());
    }

    #[test]
    fn body_root_is_order_sensitive() {
        let a = vec![b"a".to_vec(), b"b".to_vec()];
        let b = vec![b"b".to_vec(), b"a".to_vec()];
        assert_ne!(body_root(&a), body_root(&b));
    }

    #[test]
    fn well_formed_block_checks_body() {
        let body = vec![b"tx".to_vec()];
        let mut block = Block {
            header: BlockHeader { body_root: body_root(&body), ..header(1) },
            body,
            justification: None,
        };
        assert!(block.is_well_formed());
        block.body.push(b"smuggled".to_vec());
        assert!(!block.is_well_formed());
    }

    #[test]
    fn state_root_ignores_input_order() {
        let a = StateEntry { key: b"a".to_vec(), value: b"1".to_vec() };
        let b = StateEntry { key: b"b".to_vec(), value: b"2".to_vec() };
        assert_eq!(state_root(&[a.clone(), b.clone()]), state_root(&[b, a.clone()]));
        assert_ne!(state_root(&[a.clone()]), state_root(&[]));
    }
}
