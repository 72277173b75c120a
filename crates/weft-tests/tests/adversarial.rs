//! Misbehaving peers against a small mesh.
//!
//! Whatever sequence of reports a node files, a peer it lists as banned is
//! never linked to it, and every peer it still lists as connected sits
//! at or above the ban threshold. Peers that send absurd heights, absurd
//! length prefixes or endless discoveries are charged and contained while
//! the node keeps working.

use proptest::prelude::*;
use std::time::Duration;
use weft_core::ChainBackend;
use weft_network::ReputationChange;
use weft_tests::helpers::*;
use weft_tests::sim::SimNetwork;

const PEERS: usize = 3;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn banned_peers_stay_disconnected(
        reports in prop::collection::vec((0..PEERS, -300i32..100, any::<bool>()), 1..24)
    ) {
        let mut sim = SimNetwork::new();
        let hub = sim.add_node(sim_config(), empty_chain(), sessions());
        let peers: Vec<usize> = (0..PEERS)
            .map(|_| sim.add_node(sim_config(), empty_chain(), sessions()))
            .collect();
        for &peer in &peers {
            sim.connect(hub, peer);
        }
        let threshold = sim_config().reputation.ban_threshold;

        for (target, value, tick) in reports {
            let peer = sim.peer_id(peers[target]);
            sim.service(hub).report_peer(peer, ReputationChange::new(value, "random report"));
            if tick {
                sim.advance(Duration::from_millis(100));
            } else {
                sim.settle();
            }

            let state = sim.network_state(hub).expect("worker answers");
            for &other in &peers {
                let id = sim.peer_id(other).to_string();
                if state.banned_peers.contains(&id) {
                    prop_assert!(!sim.is_linked(hub, other), "banned peer {} still linked", id);
                }
            }
            for connected in &state.connected_peers {
                prop_assert!(connected.reputation >= threshold);
            }
        }
    }
}

const STEP: Duration = Duration::from_millis(100);

// ======================================================================
// Adversarial Test 1: highest_possible_best_is_charged
//
// A peer whose status claims block u64::MAX is penalized and ignored by
// sync; the chain still arrives from the honest peer.
// ======================================================================

#[test]
fn highest_possible_best_is_charged() {
    let mut sim = SimNetwork::new();
    let local = sim.add_node(sim_config(), empty_chain(), sessions());
    let liar = sim.add_node(sim_config(), remote_chain(10), sessions());
    let honest = sim.add_node(sim_config(), remote_chain(10), sessions());
    sim.set_tamper(liar, inflate_status());

    sim.connect(local, liar);
    let score = sim.score(local, liar).expect("liar still connected");
    assert!(score < 0, "liar not charged: {score}");

    sim.connect(local, honest);
    let synced = sim.run_until(STEP, Duration::from_secs(10), |sim| {
        sim.chain(local).best_number() == 10
    });
    assert!(synced, "stuck at {}", sim.chain(local).best_number());
    let state = sim.network_state(local).expect("worker answers");
    assert_eq!(state.sync.best_seen, 10);
}

// ======================================================================
// Adversarial Test 2: huge_length_prefix_is_rejected
//
// Block responses that announce an absurd number of blocks are dropped as
// malformed without allocating for them, and the range is fetched from
// another peer.
// ======================================================================

#[test]
fn huge_length_prefix_is_rejected() {
    let mut sim = SimNetwork::new();
    let local = sim.add_node(sim_config(), empty_chain(), sessions());
    let liar = sim.add_node(sim_config(), remote_chain(10), sessions());
    let honest = sim.add_node(sim_config(), remote_chain(10), sessions());
    sim.set_tamper(liar, huge_block_responses());

    sim.connect(local, liar);
    assert_eq!(sim.chain(local).best_number(), 0);
    let score = sim.score(local, liar).expect("liar still connected");
    assert!(score < 0, "liar not charged: {score}");

    sim.connect(local, honest);
    let synced = sim.run_until(STEP, Duration::from_secs(10), |sim| {
        sim.chain(local).best_number() == 10
    });
    assert!(synced, "stuck at {}", sim.chain(local).best_number());
}

// ======================================================================
// Adversarial Test 3: discovery_flood_is_bounded
//
// A DHT peer that answers every lookup with hundreds of invented peers
// cannot grow the address book past its capacity.
// ======================================================================

#[test]
fn discovery_flood_is_bounded() {
    let mut config = sim_config();
    config.max_known_peers = 16;

    let mut sim = SimNetwork::new();
    let local = sim.add_node(config, empty_chain(), sessions());
    let flooder = sim.add_node(sim_config(), empty_chain(), sessions());
    sim.set_tamper(flooder, flood_closer_peers(200));
    sim.connect(local, flooder);

    for i in 0..5u8 {
        let _lookup = sim.service(local).get_value(vec![i; 8]).expect("worker running");
        sim.advance(Duration::from_millis(2_500));
    }

    let state = sim.network_state(local).expect("worker answers");
    let known = state.connected_peers.len() + state.not_connected_peers.len();
    assert!(known <= 16, "address book grew to {known}");
}
