//! Chain fixtures and configurations shared by the integration tests.

use std::sync::Arc;
use weft_core::crypto::AuthorityKey;
use weft_core::types::{state_root, StateEntry, WarpProof};
use weft_core::{BlockFactory, ChainBackend, MemoryChain, SessionInfoProvider, StaticSessionProvider};
use libp2p::PeerId;
use weft_network::protocol::{
    decode_message, encode_message, DhtPeer, DhtResponse, Status, BLOCKS_PROTOCOL, KAD_PROTOCOL, STATUS_PROTOCOL,
    WARP_PROTOCOL,
};
use weft_network::NetworkConfig;

use crate::sim::Tamper;

/// Four authority keys derived from consecutive seeds.
pub fn keys(offset: u8) -> Vec<AuthorityKey> {
    (0..4).map(|i| AuthorityKey::from_seed([offset + i; 32])).collect()
}

pub fn genesis_state() -> Vec<StateEntry> {
    vec![StateEntry {
        key: b"balance/alice".to_vec(),
        value: b"100".to_vec(),
    }]
}

/// The state every non-genesis block commits to.
pub fn synced_state() -> Vec<StateEntry> {
    (0u8..7)
        .map(|i| StateEntry {
            key: format!("account/{i}").into_bytes(),
            value: vec![i; 4],
        })
        .collect()
}

/// Three authority sets rotating every 10 blocks, finality every 5.
pub fn factory() -> BlockFactory {
    BlockFactory::new(vec![keys(1), keys(10), keys(20)])
        .set_period(10)
        .finality_period(5)
        .state_root(state_root(&synced_state()))
}

/// `n` blocks on the shared genesis, holding the state they commit to.
pub fn remote_chain(n: u64) -> Arc<MemoryChain> {
    let chain = MemoryChain::with_genesis(genesis_state());
    if n > 0 {
        chain
            .import_blocks(factory().build_on(&chain.best_header(), n))
            .expect("factory blocks import");
        chain.set_state(synced_state());
    }
    Arc::new(chain)
}

/// Just the genesis block.
pub fn empty_chain() -> Arc<MemoryChain> {
    Arc::new(MemoryChain::with_genesis(genesis_state()))
}

/// Extend `chain` by `n` blocks and return the new best header's number.
pub fn extend(chain: &MemoryChain, n: u64) -> u64 {
    chain
        .import_blocks(factory().build_on(&chain.best_header(), n))
        .expect("factory blocks import");
    chain.set_state(synced_state());
    chain.best_number()
}

pub fn sessions() -> Arc<dyn SessionInfoProvider> {
    Arc::new(StaticSessionProvider::new(factory().authority_sets()))
}

/// In-process defaults: no mDNS, no warp sync, short deadlines.
pub fn sim_config() -> NetworkConfig {
    let mut config = NetworkConfig::local();
    config.enable_mdns = false;
    config.tick_interval_ms = 100;
    config.sync.warp_sync = false;
    config.sync.request_timeout_ms = 1_000;
    config.dht.query_timeout_ms = 2_000;
    config.dht.random_walk_interval_secs = 0;
    config
}

pub fn warp_config(quorum: usize) -> NetworkConfig {
    let mut config = sim_config();
    config.sync.warp_sync = true;
    config.sync.warp_quorum = quorum;
    config
}

/// Corrupts the first signature of every warp proof a node serves.
pub fn corrupt_warp_proofs() -> Tamper {
    Box::new(|protocol, payload| {
        if protocol != WARP_PROTOCOL {
            return payload;
        }
        let Some(mut proof) = decode_message::<WarpProof>(&payload) else {
            return payload;
        };
        if let Some(signature) = proof
            .fragments
            .first_mut()
            .and_then(|fragment| fragment.justification.signatures.first_mut())
        {
            signature.1[0] ^= 1;
        }
        encode_message(&proof).unwrap_or(payload)
    })
}

/// Claims the highest possible best block in every status a node answers.
pub fn inflate_status() -> Tamper {
    Box::new(|protocol, payload| {
        if protocol != STATUS_PROTOCOL {
            return payload;
        }
        let Some(mut status) = decode_message::<Status>(&payload) else {
            return payload;
        };
        status.best_number = u64::MAX;
        encode_message(&status).unwrap_or(payload)
    })
}

/// Replaces block responses with a bare length prefix announcing more
/// blocks than could ever fit in memory.
pub fn huge_block_responses() -> Tamper {
    Box::new(|protocol, payload| {
        if protocol != BLOCKS_PROTOCOL {
            return payload;
        }
        let mut bytes = vec![253];
        bytes.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        bytes
    })
}

/// Pads every DHT answer with `count` made-up peers.
pub fn flood_closer_peers(count: usize) -> Tamper {
    Box::new(move |protocol, payload| {
        if protocol != KAD_PROTOCOL {
            return payload;
        }
        let Some(mut response) = decode_message::<DhtResponse>(&payload) else {
            return payload;
        };
        response.closer_peers.extend((0..count).map(|i| DhtPeer {
            peer_id: PeerId::random().to_bytes(),
            addresses: vec![format!("/memory/{}", 100_000 + i)],
        }));
        encode_message(&response).unwrap_or(payload)
    })
}
