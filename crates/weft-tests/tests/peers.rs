//! Connection management across simulated nodes.
//!
//! Every node runs a real network worker; only the wire is simulated (see
//! `weft_tests::sim`). These tests cover what one node's decisions do to
//! its peers: bans, notification slots and block announcements.

use libp2p::futures::FutureExt;
use std::time::Duration;
use weft_core::error::NotificationError;
use weft_core::ChainBackend;
use weft_network::{Event, NotificationEvent, ProtocolHandle, ProtocolKind, ReputationChange};
use weft_tests::helpers::*;
use weft_tests::sim::SimNetwork;

const CHAT: &str = "/app/chat/1";

/// Register `CHAT` on `node` and return its event receiver.
fn register_chat(sim: &mut SimNetwork, node: usize) -> tokio::sync::mpsc::Receiver<NotificationEvent> {
    let registration = Box::pin(sim.service(node).register_protocol(CHAT, ProtocolKind::Notification));
    let handle = sim
        .block_on(Duration::from_millis(100), Duration::from_secs(1), registration)
        .expect("registration completes")
        .expect("protocol registers");
    match handle {
        ProtocolHandle::Notifications(rx) => rx,
        ProtocolHandle::Requests(_) => panic!("registered a notification protocol"),
    }
}

// ======================================================================
// Peers Test 1: ban_disconnects_within_the_same_step
//
// A report that pushes a peer past the ban threshold must drop the
// connection right away, not on the next tick, and the ban must keep the
// peer out while it lasts.
// ======================================================================

#[test]
fn ban_disconnects_within_the_same_step() {
    let mut sim = SimNetwork::new();
    let a = sim.add_node(sim_config(), remote_chain(3), sessions());
    let b = sim.add_node(sim_config(), remote_chain(3), sessions());
    sim.connect(a, b);
    assert!(sim.is_linked(a, b));

    sim.service(a)
        .report_peer(sim.peer_id(b), ReputationChange::new(-600, "misbehaved"));
    sim.settle();

    assert!(!sim.is_linked(a, b), "ban applied without waiting for a tick");
    assert!(sim.events(a).contains(&Event::PeerDisconnected(sim.peer_id(b))));
    let state = sim.network_state(a).expect("worker answers");
    assert_eq!(state.banned_peers, vec![sim.peer_id(b).to_string()]);

    // Neither side gets the connection back while the ban holds.
    for _ in 0..20 {
        sim.advance(Duration::from_millis(500));
    }
    assert!(!sim.is_linked(a, b));
    assert!(sim.peers(a).iter().all(|info| info.peer_id != sim.peer_id(b)));
}

// ======================================================================
// Peers Test 2: reserved_slot_fails_after_disconnect
//
// A slot reserved while the peer was connected must not deliver once the
// peer is gone: `send` reports NotConnected instead of silently queueing.
// ======================================================================

#[test]
fn reserved_slot_fails_after_disconnect() {
    let mut sim = SimNetwork::new();
    let a = sim.add_node(sim_config(), empty_chain(), sessions());
    let b = sim.add_node(sim_config(), empty_chain(), sessions());
    let _a_chat = register_chat(&mut sim, a);
    let mut b_chat = register_chat(&mut sim, b);

    sim.connect(a, b);
    let peer_a = sim.peer_id(a);
    let peer_b = sim.peer_id(b);
    assert!(matches!(
        b_chat.try_recv(),
        Ok(NotificationEvent::Opened { peer, .. }) if peer == peer_a
    ));

    // While connected a reserved slot delivers.
    let sender = sim.service(a).notification_sender(&peer_b, CHAT).expect("stream open");
    sender.reserve().expect("slot free").send(b"hello".to_vec()).expect("connected");
    sim.tick();
    assert_eq!(
        b_chat.try_recv(),
        Ok(NotificationEvent::Received {
            peer: peer_a,
            payload: b"hello".to_vec(),
        })
    );

    let ready = sender.reserve().expect("slot free");
    sim.service(a).disconnect(peer_b);
    sim.settle();

    assert!(!sim.is_linked(a, b));
    assert_eq!(ready.send(b"too late".to_vec()), Err(NotificationError::NotConnected));
    assert_eq!(b_chat.try_recv(), Ok(NotificationEvent::Closed { peer: peer_a }));
    assert!(sim.service(a).notification_sender(&peer_b, CHAT).is_err());
}

// ======================================================================
// Peers Test 3: announced_blocks_are_downloaded
//
// Two nodes in step; one imports new blocks and announces its best. The
// other learns about them only through the announcement and must fetch
// them.
// ======================================================================

#[test]
fn announced_blocks_are_downloaded() {
    let mut sim = SimNetwork::new();
    let a = sim.add_node(sim_config(), remote_chain(5), sessions());
    let b = sim.add_node(sim_config(), remote_chain(5), sessions());
    sim.connect(a, b);
    sim.events(b);

    let best = extend(sim.chain(a), 4);
    assert_eq!(best, 9);
    let header = sim.chain(a).best_header();
    sim.service(a).announce_block(header.clone());

    let synced = sim.run_until(Duration::from_millis(100), Duration::from_secs(10), |sim| {
        sim.chain(b).best_number() == 9
    });
    assert!(synced, "b stuck at {}", sim.chain(b).best_number());
    assert_eq!(sim.chain(b).best_header(), header);
    assert!(sim.events(b).contains(&Event::BlockAnnounced {
        peer: sim.peer_id(a),
        header,
    }));
}

// ======================================================================
// Peers Test 4: explicit_dial_reports_the_outcome
//
// `connect` resolves once the dial is accepted; dialing yourself is an
// error the caller sees.
// ======================================================================

#[test]
fn explicit_dial_reports_the_outcome() {
    let mut sim = SimNetwork::new();
    let a = sim.add_node(sim_config(), empty_chain(), sessions());
    let b = sim.add_node(sim_config(), empty_chain(), sessions());

    let address = sim.node(b).address.clone();
    let dial = sim.service(a).connect(sim.peer_id(b), vec![address]);
    sim.settle();
    assert!(matches!(dial.now_or_never(), Some(Ok(()))));
    assert!(sim.is_linked(a, b));

    let own = sim.node(a).address.clone();
    let dial = sim.service(a).connect(sim.peer_id(a), vec![own]);
    sim.settle();
    assert!(matches!(dial.now_or_never(), Some(Err(_))));
}
