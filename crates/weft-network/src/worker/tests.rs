use super::*;
use tokio::sync::broadcast::error::TryRecvError;
use weft_core::crypto::AuthorityKey;
use weft_core::types::StateEntry;
use weft_core::{BlockFactory, MemoryChain, StaticSessionProvider};

use crate::protocol::{BlockRequest, BlockResponse, WireRequest};
use crate::transport::RequestId;

// ---- Helpers ----

fn genesis_state() -> Vec<StateEntry> {
    vec![StateEntry {
        key: b"k".to_vec(),
        value: b"v".to_vec(),
    }]
}

fn factory() -> BlockFactory {
    let keys = (1..=3).map(|i| AuthorityKey::from_seed([i; 32])).collect();
    BlockFactory::new(vec![keys])
}

fn chain_with(blocks: u64) -> Arc<MemoryChain> {
    let chain = MemoryChain::with_genesis(genesis_state());
    if blocks > 0 {
        chain.import_blocks(factory().build_on(&chain.best_header(), blocks)).unwrap();
    }
    Arc::new(chain)
}

fn worker_with(config: NetworkConfig, chain: Arc<MemoryChain>) -> (NetworkWorker, NetworkService) {
    let sessions = Arc::new(StaticSessionProvider::new(factory().authority_sets()));
    NetworkWorker::new(config, PeerId::random(), chain, sessions)
}

fn worker() -> (NetworkWorker, NetworkService) {
    worker_with(NetworkConfig::default(), chain_with(0))
}

fn addr(port: u16) -> Multiaddr {
    format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
}

fn status_from(chain: &MemoryChain) -> Status {
    let best = chain.best_header();
    let finalized = chain.finalized_header();
    Status {
        genesis_hash: chain.genesis_hash(),
        role: ObservedRole::Full,
        best_number: best.number,
        best_hash: best.hash(),
        finalized_number: finalized.number,
        finalized_hash: finalized.hash(),
        protocols: BUILTIN_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
    }
}

fn requests_on(actions: &[TransportAction], protocol: &str) -> Vec<(PeerId, RequestId, Vec<u8>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            TransportAction::SendRequest {
                peer,
                request_id,
                request: WireRequest::Request { protocol: p, payload },
            } if p == protocol => Some((*peer, *request_id, payload.clone())),
            _ => None,
        })
        .collect()
}

fn disconnects(actions: &[TransportAction]) -> Vec<PeerId> {
    actions
        .iter()
        .filter_map(|a| match a {
            TransportAction::Disconnect { peer } => Some(*peer),
            _ => None,
        })
        .collect()
}

fn events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Accept an inbound connection from `peer` and answer its status request
/// with `status`. Returns the actions produced along the way.
fn handshake(worker: &mut NetworkWorker, peer: PeerId, status: &Status, now: Instant) -> Vec<TransportAction> {
    worker.handle_transport_event(
        TransportEvent::ConnectionEstablished {
            peer,
            address: None,
            inbound: true,
        },
        now,
    );
    let mut actions = worker.drain_actions();
    let (_, request_id, _) = requests_on(&actions, STATUS_PROTOCOL)
        .into_iter()
        .find(|(p, _, _)| *p == peer)
        .expect("status request sent");
    worker.handle_transport_event(
        TransportEvent::Response {
            peer,
            request_id,
            result: Ok(WireResponse::Response(encode_message(status).unwrap())),
        },
        now,
    );
    actions.extend(worker.drain_actions());
    actions
}

// ---- Tests ----

/// A completed handshake opens the block-announce stream and records the
/// peer's role and best block.
#[test]
fn status_handshake_opens_notifications() {
    let (mut worker, service) = worker();
    let mut rx = service.event_stream();
    let now = Instant::now();
    let peer = PeerId::random();

    handshake(&mut worker, peer, &status_from(&chain_with(0)), now);

    let events = events(&mut rx);
    assert_eq!(events[0], Event::PeerConnected(peer));
    assert!(events.contains(&Event::NotificationStreamOpened {
        peer,
        protocol: BLOCK_ANNOUNCES_PROTOCOL.to_string(),
        role: ObservedRole::Full,
    }));
    let state = worker.network_state(now);
    assert_eq!(state.connected_peers.len(), 1);
    assert_eq!(state.connected_peers[0].role, Some(ObservedRole::Full));
    assert_eq!(
        state.connected_peers[0].open_notifications,
        vec![BLOCK_ANNOUNCES_PROTOCOL.to_string()]
    );
}

/// A peer on another genesis is banned and disconnected on the spot.
#[test]
fn genesis_mismatch_bans_and_disconnects() {
    let (mut worker, _service) = worker();
    let now = Instant::now();
    let peer = PeerId::random();
    let mut status = status_from(&chain_with(0));
    status.genesis_hash = Hash256([0xee; 32]);

    let actions = handshake(&mut worker, peer, &status, now);

    assert_eq!(disconnects(&actions), vec![peer]);
    assert!(worker.reputation.is_banned(&peer, now));
    let state = worker.network_state(now);
    assert_eq!(state.banned_peers, vec![peer.to_string()]);
}

/// A report that crosses the ban threshold disconnects without waiting for
/// the next tick.
#[test]
fn ban_disconnects_immediately() {
    let (mut worker, _service) = worker();
    let now = Instant::now();
    let peer = PeerId::random();
    handshake(&mut worker, peer, &status_from(&chain_with(0)), now);

    worker.handle_command(
        Command::ReportPeer {
            peer,
            change: ReputationChange {
                value: -800,
                reason: "misbehaviour",
            },
        },
        now,
    );

    assert_eq!(disconnects(&worker.drain_actions()), vec![peer]);
    // The ban survives the connection closing.
    worker.handle_transport_event(TransportEvent::ConnectionClosed { peer }, now);
    assert!(worker.reputation.is_banned(&peer, now));
}

/// Reserved peers are dialed on the first tick; after a failed dial they
/// wait out the backoff.
#[test]
fn reserved_peer_dialed_then_backed_off() {
    let reserved = PeerId::random();
    let config = NetworkConfig {
        reserved_peers: vec![format!("{}/p2p/{reserved}", addr(4000))],
        ..NetworkConfig::default()
    };
    let (mut worker, _service) = worker_with(config, chain_with(0));
    let now = Instant::now();

    worker.tick(now);
    let dials: Vec<_> = worker
        .drain_actions()
        .into_iter()
        .filter_map(|a| match a {
            TransportAction::Dial { peer, addresses } => Some((peer, addresses)),
            _ => None,
        })
        .collect();
    assert_eq!(dials, vec![(reserved, vec![addr(4000)])]);

    worker.handle_transport_event(
        TransportEvent::DialFailure {
            peer: reserved,
            error: "refused".into(),
        },
        now,
    );
    worker.tick(now + Duration::from_secs(1));
    assert!(
        !worker
            .drain_actions()
            .iter()
            .any(|a| matches!(a, TransportAction::Dial { .. }))
    );
    // One tick of decay since the failure.
    assert_eq!(worker.reputation.score(&reserved), COST_DIAL_FAILURE.value + 1);
}

/// An announced block ahead of us is published and fetched from the
/// announcing peer.
#[test]
fn block_announce_triggers_download() {
    let (mut worker, service) = worker();
    let mut rx = service.event_stream();
    let now = Instant::now();
    let peer = PeerId::random();
    handshake(&mut worker, peer, &status_from(&chain_with(0)), now);
    events(&mut rx);

    let remote = chain_with(3);
    let header = remote.best_header();
    worker.handle_transport_event(
        TransportEvent::InboundRequest {
            peer,
            request_id: RequestId(900),
            request: WireRequest::Notifications {
                protocol: BLOCK_ANNOUNCES_PROTOCOL.to_string(),
                payloads: vec![encode_message(&BlockAnnounce { header: header.clone() }).unwrap()],
            },
        },
        now,
    );

    assert!(events(&mut rx).contains(&Event::BlockAnnounced {
        peer,
        header: header.clone()
    }));
    let actions = worker.drain_actions();
    assert!(actions.contains(&TransportAction::SendResponse {
        request_id: RequestId(900),
        response: WireResponse::Ack,
    }));
    let requests = requests_on(&actions, BLOCKS_PROTOCOL);
    assert_eq!(requests.len(), 1);
    let request: BlockRequest = decode_message(&requests[0].2).unwrap();
    assert_eq!(request.from, 1);
}

/// Block requests from peers are served from the local chain.
#[test]
fn serves_inbound_block_request() {
    let (mut worker, _service) = worker_with(NetworkConfig::default(), chain_with(4));
    let now = Instant::now();
    let peer = PeerId::random();

    worker.handle_transport_event(
        TransportEvent::InboundRequest {
            peer,
            request_id: RequestId(7),
            request: WireRequest::Request {
                protocol: BLOCKS_PROTOCOL.to_string(),
                payload: encode_message(&BlockRequest { from: 2, count: 2 }).unwrap(),
            },
        },
        now,
    );

    let response = worker
        .drain_actions()
        .into_iter()
        .find_map(|a| match a {
            TransportAction::SendResponse {
                request_id: RequestId(7),
                response: WireResponse::Response(bytes),
            } => Some(bytes),
            _ => None,
        })
        .expect("response sent");
    let blocks: BlockResponse = decode_message(&response).unwrap();
    let numbers: Vec<u64> = blocks.blocks.iter().map(|b| b.header.number).collect();
    assert_eq!(numbers, vec![2, 3]);
}

/// Closing a connection closes its notification streams and frees the slot.
#[test]
fn disconnect_closes_streams() {
    let (mut worker, service) = worker();
    let mut rx = service.event_stream();
    let now = Instant::now();
    let peer = PeerId::random();
    handshake(&mut worker, peer, &status_from(&chain_with(0)), now);
    events(&mut rx);

    worker.handle_transport_event(TransportEvent::ConnectionClosed { peer }, now);

    assert_eq!(
        events(&mut rx),
        vec![
            Event::NotificationStreamClosed {
                peer,
                protocol: BLOCK_ANNOUNCES_PROTOCOL.to_string(),
            },
            Event::PeerDisconnected(peer),
        ]
    );
    assert_eq!(worker.network_state(now).connected_peers.len(), 0);
    assert!(matches!(
        service.notification_sender(&peer, BLOCK_ANNOUNCES_PROTOCOL),
        Err(weft_core::error::NotificationError::NotConnected)
    ));
}

/// Requests on unregistered protocols fail without touching the wire.
#[test]
fn send_request_requires_registered_protocol() {
    let (mut worker, _service) = worker();
    let now = Instant::now();
    let (reply, mut rx) = oneshot::channel();
    worker.handle_command(
        Command::SendRequest {
            peer: PeerId::random(),
            protocol: "/app/unknown/1".into(),
            payload: vec![1],
            timeout: None,
            if_disconnected: IfDisconnected::ImmediateError,
            reply,
        },
        now,
    );
    assert_eq!(rx.try_recv().unwrap(), Err(RequestFailure::UnknownProtocol));
    assert!(worker.drain_actions().is_empty());
}

/// Registering a protocol re-advertises the status to connected peers.
#[test]
fn registration_resends_status() {
    let (mut worker, _service) = worker();
    let now = Instant::now();
    let peer = PeerId::random();
    handshake(&mut worker, peer, &status_from(&chain_with(0)), now);

    let (reply, mut rx) = oneshot::channel();
    worker.handle_command(
        Command::RegisterProtocol {
            name: "/app/chat/1".into(),
            kind: ProtocolKind::Notification,
            reply,
        },
        now,
    );
    assert!(rx.try_recv().unwrap().is_ok());
    let sent = requests_on(&worker.drain_actions(), STATUS_PROTOCOL);
    assert_eq!(sent.len(), 1);
    let status: Status = decode_message(&sent[0].2).unwrap();
    assert!(status.protocols.contains(&"/app/chat/1".to_string()));
}
