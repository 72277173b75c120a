//! Serving chain data to peers.
//!
//! Answers block, state, warp-proof and bitswap requests from the local
//! [`ChainBackend`]. Every request first passes the per-peer, per-protocol
//! [`RateLimiter`]; a peer over its limit is refused and penalised.
//! Responses are capped in entries and in bytes.

use libp2p::PeerId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};
use weft_core::types::Block;
use weft_core::ChainBackend;

use crate::config::NetworkConfig;
use crate::protocol::{
    decode_message, encode_message, BitswapRequest, BitswapResponse, BlockRequest, BlockResponse, StateRequest,
    WarpRequest, WireResponse, BITSWAP_PROTOCOL, BLOCKS_PROTOCOL, STATE_PROTOCOL, WARP_PROTOCOL,
};
use crate::rate_limiter::RateLimiter;
use crate::reputation::{ReputationChange, COST_BAD_MESSAGE, COST_RATE_LIMITED};

/// Blocks returned per request.
pub const MAX_BLOCKS_PER_RESPONSE: u32 = 256;
/// State entries returned per request.
pub const MAX_STATE_ENTRIES_PER_RESPONSE: u32 = 4096;
/// Body bytes per block response.
pub const MAX_BLOCK_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

/// Answer to an inbound request plus any penalty for the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub response: WireResponse,
    pub report: Option<ReputationChange>,
}

impl HandlerOutcome {
    fn ok(response: WireResponse) -> Self {
        Self { response, report: None }
    }

    fn refused(report: Option<ReputationChange>) -> Self {
        Self {
            response: WireResponse::Refused,
            report,
        }
    }
}

pub struct RequestHandlers {
    chain: Arc<dyn ChainBackend>,
    limiter: RateLimiter,
    max_warp_fragments: usize,
}

impl RequestHandlers {
    pub fn new(chain: Arc<dyn ChainBackend>, config: &NetworkConfig) -> Self {
        Self {
            chain,
            limiter: RateLimiter::new(&config.rate_limit),
            max_warp_fragments: config.sync.max_warp_fragments,
        }
    }

    /// Count a request against the peer's limit. `false` means refuse.
    pub fn admit(&mut self, peer: &PeerId, protocol: &str, now: Instant) -> bool {
        self.limiter.check_and_record(peer, protocol, now)
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.limiter.remove_peer(peer);
    }

    /// Serve a chain-data request. Unknown protocols yield
    /// [`WireResponse::UnknownProtocol`].
    pub fn handle(&mut self, peer: &PeerId, protocol: &str, payload: &[u8], now: Instant) -> HandlerOutcome {
        if !self.admit(peer, protocol, now) {
            return HandlerOutcome::refused(Some(COST_RATE_LIMITED));
        }
        let outcome = match protocol {
            BLOCKS_PROTOCOL => decode_message(payload).map(|req| self.serve_blocks(req)),
            STATE_PROTOCOL => decode_message(payload).map(|req| self.serve_state(req)),
            WARP_PROTOCOL => decode_message(payload).map(|req| self.serve_warp(req)),
            BITSWAP_PROTOCOL => decode_message(payload).map(|req| self.serve_content(req)),
            _ => return HandlerOutcome::ok(WireResponse::UnknownProtocol),
        };
        match outcome {
            Some(outcome) => outcome,
            None => {
                debug!(%peer, protocol, "handlers: malformed request");
                HandlerOutcome::refused(Some(COST_BAD_MESSAGE))
            }
        }
    }

    fn encode<T: bincode::Encode>(msg: &T) -> HandlerOutcome {
        match encode_message(msg) {
            Ok(bytes) => HandlerOutcome::ok(WireResponse::Response(bytes)),
            Err(e) => {
                warn!(error = %e, "handlers: response encoding failed");
                HandlerOutcome::refused(None)
            }
        }
    }

    fn serve_blocks(&self, req: BlockRequest) -> HandlerOutcome {
        let count = req.count.min(MAX_BLOCKS_PER_RESPONSE) as u64;
        let mut blocks: Vec<Block> = Vec::new();
        let mut bytes = 0usize;
        for number in req.from..req.from.saturating_add(count) {
            let Some(block) = self.chain.block(number) else {
                break;
            };
            bytes += block.body.iter().map(Vec::len).sum::<usize>();
            if bytes > MAX_BLOCK_RESPONSE_BYTES && !blocks.is_empty() {
                break;
            }
            blocks.push(block);
        }
        trace!(from = req.from, served = blocks.len(), "handlers: blocks");
        Self::encode(&BlockResponse { blocks })
    }

    fn serve_state(&self, req: StateRequest) -> HandlerOutcome {
        let max = req.max_entries.clamp(1, MAX_STATE_ENTRIES_PER_RESPONSE) as usize;
        match self.chain.state_entries(&req.block, &req.start_key, max) {
            Some(chunk) => {
                trace!(block = %req.block.short(), entries = chunk.entries.len(), "handlers: state chunk");
                Self::encode(&chunk)
            }
            None => HandlerOutcome::refused(None),
        }
    }

    fn serve_warp(&self, req: WarpRequest) -> HandlerOutcome {
        match self.chain.warp_proof(&req.begin, self.max_warp_fragments) {
            Some(proof) => {
                trace!(begin = %req.begin.short(), fragments = proof.fragments.len(), "handlers: warp proof");
                Self::encode(&proof)
            }
            None => HandlerOutcome::refused(None),
        }
    }

    fn serve_content(&self, req: BitswapRequest) -> HandlerOutcome {
        Self::encode(&BitswapResponse {
            data: self.chain.content(&req.cid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use weft_core::crypto::AuthorityKey;
    use weft_core::types::{Hash256, StateChunk, StateEntry, WarpProof};
    use weft_core::{BlockFactory, MemoryChain, MockChainBackend};

    // ---- Helpers ----

    fn chain_with(blocks: u64) -> Arc<MemoryChain> {
        let chain = MemoryChain::with_genesis(vec![StateEntry {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        }]);
        let factory = BlockFactory::new(vec![vec![AuthorityKey::from_seed([1; 32])]]);
        let genesis = chain.best_header();
        chain.import_blocks(factory.build_on(&genesis, blocks)).unwrap();
        Arc::new(chain)
    }

    fn handlers(chain: Arc<dyn ChainBackend>) -> RequestHandlers {
        RequestHandlers::new(chain, &NetworkConfig::default())
    }

    fn payload(outcome: &HandlerOutcome) -> &[u8] {
        match &outcome.response {
            WireResponse::Response(bytes) => bytes,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    // ---- Tests ----

    #[test]
    fn serves_block_range() {
        let mut h = handlers(chain_with(10));
        let req = encode_message(&BlockRequest { from: 3, count: 4 }).unwrap();
        let outcome = h.handle(&PeerId::random(), BLOCKS_PROTOCOL, &req, Instant::now());
        let resp: BlockResponse = decode_message(payload(&outcome)).unwrap();
        let numbers: Vec<u64> = resp.blocks.iter().map(Block::number).collect();
        assert_eq!(numbers, vec![3, 4, 5, 6]);
    }

    /// A range past the tip returns what exists.
    #[test]
    fn block_range_truncated_at_tip() {
        let mut h = handlers(chain_with(5));
        let req = encode_message(&BlockRequest { from: 4, count: 10 }).unwrap();
        let outcome = h.handle(&PeerId::random(), BLOCKS_PROTOCOL, &req, Instant::now());
        let resp: BlockResponse = decode_message(payload(&outcome)).unwrap();
        assert_eq!(resp.blocks.len(), 2);
    }

    #[test]
    fn serves_state_and_warp() {
        let chain = chain_with(3);
        let genesis = chain.genesis_hash();
        let mut h = handlers(chain);
        let now = Instant::now();
        let peer = PeerId::random();

        let req = encode_message(&StateRequest {
            block: genesis,
            start_key: Vec::new(),
            max_entries: 10,
        })
        .unwrap();
        let chunk: StateChunk = decode_message(payload(&h.handle(&peer, STATE_PROTOCOL, &req, now))).unwrap();
        assert_eq!(chunk.entries.len(), 1);
        assert!(chunk.complete);

        let req = encode_message(&WarpRequest { begin: genesis }).unwrap();
        let proof: WarpProof = decode_message(payload(&h.handle(&peer, WARP_PROTOCOL, &req, now))).unwrap();
        assert!(proof.is_finished);
        assert_eq!(proof.fragments.last().map(|f| f.header.number), Some(3));
    }

    #[test]
    fn unknown_warp_begin_refused() {
        let mut h = handlers(chain_with(1));
        let req = encode_message(&WarpRequest {
            begin: Hash256([9; 32]),
        })
        .unwrap();
        let outcome = h.handle(&PeerId::random(), WARP_PROTOCOL, &req, Instant::now());
        assert_eq!(outcome, HandlerOutcome::refused(None));
    }

    #[test]
    fn serves_content_by_id() {
        let mut mock = MockChainBackend::new();
        mock.expect_content()
            .returning(|cid| (*cid == Hash256::blake3(b"body")).then(|| b"body".to_vec()));
        let mut h = handlers(Arc::new(mock));
        let now = Instant::now();
        let peer = PeerId::random();

        let hit = encode_message(&BitswapRequest {
            cid: Hash256::blake3(b"body"),
        })
        .unwrap();
        let resp: BitswapResponse = decode_message(payload(&h.handle(&peer, BITSWAP_PROTOCOL, &hit, now))).unwrap();
        assert_eq!(resp.data, Some(b"body".to_vec()));

        let miss = encode_message(&BitswapRequest { cid: Hash256::ZERO }).unwrap();
        let resp: BitswapResponse = decode_message(payload(&h.handle(&peer, BITSWAP_PROTOCOL, &miss, now))).unwrap();
        assert_eq!(resp.data, None);
    }

    #[test]
    fn malformed_request_penalised() {
        let mut h = handlers(chain_with(1));
        let outcome = h.handle(&PeerId::random(), BLOCKS_PROTOCOL, &[0xff; 3], Instant::now());
        assert_eq!(outcome, HandlerOutcome::refused(Some(COST_BAD_MESSAGE)));
    }

    /// Over the limit: refused with a penalty.
    #[test]
    fn rate_limited() {
        let config = NetworkConfig {
            rate_limit: RateLimitConfig {
                window_secs: 60,
                requests_per_window: 2,
            },
            ..NetworkConfig::default()
        };
        let mut h = RequestHandlers::new(chain_with(1), &config);
        let now = Instant::now();
        let peer = PeerId::random();
        let req = encode_message(&BlockRequest { from: 1, count: 1 }).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                h.handle(&peer, BLOCKS_PROTOCOL, &req, now).response,
                WireResponse::Response(_)
            ));
        }
        assert_eq!(
            h.handle(&peer, BLOCKS_PROTOCOL, &req, now),
            HandlerOutcome::refused(Some(COST_RATE_LIMITED))
        );
        // Another peer is unaffected.
        assert!(h.admit(&PeerId::random(), BLOCKS_PROTOCOL, now));
    }
}
