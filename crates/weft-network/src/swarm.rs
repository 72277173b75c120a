//! libp2p transport and node bootstrap.
//!
//! [`SwarmTransport`] adapts a libp2p swarm to the [`Transport`] seam, and
//! [`NetworkNode::start`] builds the swarm, spawns the worker over it and
//! returns the service handle.

use libp2p::futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::request_response::{self, InboundRequestId, OutboundRequestId, ResponseChannel};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, mdns, Multiaddr, PeerId, Swarm, SwarmBuilder};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use weft_core::error::{NetworkError, OutboundFailure};
use weft_core::{ChainBackend, SessionInfoProvider};

use crate::behaviour::{build_behaviour, WeftBehaviour, WeftBehaviourEvent};
use crate::config::NetworkConfig;
use crate::protocol::{WireRequest, WireResponse};
use crate::service::NetworkService;
use crate::transport::{RequestId, Transport, TransportAction, TransportEvent};
use crate::worker::NetworkWorker;

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Response channels of inbound requests still owed an answer.
///
/// An entry leaves when the worker answers it, when libp2p reports the
/// request as failed (key `K`), or when the last connection to its peer
/// closes.
struct PendingInbound<K, C> {
    next: u64,
    entries: HashMap<RequestId, (PeerId, K, C)>,
}

impl<K: PartialEq, C> PendingInbound<K, C> {
    fn new() -> Self {
        Self {
            next: 0,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, peer: PeerId, key: K, channel: C) -> RequestId {
        self.next += 1;
        let id = RequestId(self.next);
        self.entries.insert(id, (peer, key, channel));
        id
    }

    fn take(&mut self, id: &RequestId) -> Option<C> {
        self.entries.remove(id).map(|(_, _, channel)| channel)
    }

    fn on_failure(&mut self, key: &K) {
        self.entries.retain(|_, (_, k, _)| k != key);
    }

    fn on_peer_closed(&mut self, peer: &PeerId) {
        self.entries.retain(|_, (p, _, _)| p != peer);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct SwarmTransport {
    swarm: Swarm<WeftBehaviour>,
    outbound: HashMap<OutboundRequestId, RequestId>,
    inbound: PendingInbound<InboundRequestId, ResponseChannel<WireResponse>>,
    pending: VecDeque<TransportEvent>,
}

impl SwarmTransport {
    pub fn new(swarm: Swarm<WeftBehaviour>) -> Self {
        Self {
            swarm,
            outbound: HashMap::new(),
            inbound: PendingInbound::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<WeftBehaviourEvent>) {
        match event {
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                if num_established.get() != 1 {
                    return;
                }
                let inbound = !endpoint.is_dialer();
                let address = (!inbound).then(|| endpoint.get_remote_address().clone());
                self.pending.push_back(TransportEvent::ConnectionEstablished {
                    peer: peer_id,
                    address,
                    inbound,
                });
            }
            SwarmEvent::ConnectionClosed {
                peer_id, num_established, ..
            } => {
                if num_established == 0 {
                    self.inbound.on_peer_closed(&peer_id);
                    self.pending.push_back(TransportEvent::ConnectionClosed { peer: peer_id });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer), error, ..
            } => {
                self.pending.push_back(TransportEvent::DialFailure {
                    peer,
                    error: error.to_string(),
                });
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                self.pending.push_back(TransportEvent::NewListenAddr(address));
            }
            SwarmEvent::Behaviour(WeftBehaviourEvent::Mux(event)) => self.on_mux_event(event),
            SwarmEvent::Behaviour(WeftBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                for address in info.listen_addrs {
                    self.pending.push_back(TransportEvent::AddressDiscovered { peer: peer_id, address });
                }
            }
            SwarmEvent::Behaviour(WeftBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer, address) in peers {
                    debug!(%peer, %address, "network: mDNS discovered peer");
                    self.pending.push_back(TransportEvent::AddressDiscovered { peer, address });
                }
            }
            other => trace!(event = ?other, "network: swarm event"),
        }
    }

    fn on_mux_event(&mut self, event: request_response::Event<WireRequest, WireResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request_id: inbound_id,
                    request,
                    channel,
                } => {
                    let request_id = self.inbound.insert(peer, inbound_id, channel);
                    trace!(%peer, pending = self.inbound.len(), "network: inbound request");
                    self.pending.push_back(TransportEvent::InboundRequest {
                        peer,
                        request_id,
                        request,
                    });
                }
                request_response::Message::Response { request_id, response } => {
                    if let Some(request_id) = self.outbound.remove(&request_id) {
                        self.pending.push_back(TransportEvent::Response {
                            peer,
                            request_id,
                            result: Ok(response),
                        });
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            } => {
                if let Some(request_id) = self.outbound.remove(&request_id) {
                    self.pending.push_back(TransportEvent::Response {
                        peer,
                        request_id,
                        result: Err(outbound_failure(&error)),
                    });
                }
            }
            request_response::Event::InboundFailure {
                peer, request_id, error, ..
            } => {
                debug!(%peer, %error, "network: inbound request failed");
                self.inbound.on_failure(&request_id);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

fn outbound_failure(error: &request_response::OutboundFailure) -> OutboundFailure {
    match error {
        request_response::OutboundFailure::DialFailure => OutboundFailure::DialFailure,
        request_response::OutboundFailure::Timeout => OutboundFailure::Timeout,
        request_response::OutboundFailure::UnsupportedProtocols => OutboundFailure::UnsupportedProtocols,
        _ => OutboundFailure::ConnectionClosed,
    }
}

#[async_trait::async_trait]
impl Transport for SwarmTransport {
    fn apply(&mut self, action: TransportAction) {
        match action {
            TransportAction::Dial { peer, addresses } => {
                let opts = DialOpts::peer_id(peer).addresses(addresses).build();
                if let Err(e) = self.swarm.dial(opts) {
                    self.pending.push_back(TransportEvent::DialFailure {
                        peer,
                        error: e.to_string(),
                    });
                }
            }
            TransportAction::Disconnect { peer } => {
                if self.swarm.disconnect_peer_id(peer).is_err() {
                    // Nothing to close; let the worker release the slot.
                    self.pending.push_back(TransportEvent::ConnectionClosed { peer });
                }
            }
            TransportAction::SendRequest {
                peer,
                request_id,
                request,
            } => {
                let outbound = self.swarm.behaviour_mut().mux.send_request(&peer, request);
                self.outbound.insert(outbound, request_id);
            }
            TransportAction::SendResponse { request_id, response } => {
                let Some(channel) = self.inbound.take(&request_id) else {
                    trace!(id = %request_id, "network: response for unknown inbound request");
                    return;
                };
                if self.swarm.behaviour_mut().mux.send_response(channel, response).is_err() {
                    debug!(id = %request_id, "network: requester went away before the response");
                }
            }
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let event = self.swarm.select_next_some().await;
            self.on_swarm_event(event);
        }
    }
}

/// Load an Ed25519 node key from `path`, or generate one and save it there.
///
/// The file holds the raw 32-byte secret, so the peer id is stable across
/// restarts. New files are created with mode `0o600` on Unix.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, NetworkError> {
    let node_key = |what: &str, e: &dyn std::fmt::Display| {
        NetworkError::NodeKey(format!("{what} '{}': {e}", path.display()))
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(|e| node_key("failed to read", &e))?;
        let keypair = Keypair::ed25519_from_bytes(bytes).map_err(|e| node_key("invalid key in", &e))?;
        info!(path = %path.display(), "network: loaded node key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| node_key("failed to create directory for", &e))?;
    }
    let secret = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| node_key("not an Ed25519 key", &e))?
        .secret();
    std::fs::write(path, secret.as_ref()).map_err(|e| node_key("failed to write", &e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| node_key("failed to restrict", &e))?;
    }

    info!(path = %path.display(), "network: generated node key");
    Ok(keypair)
}

/// A running network: the worker task and the handle to it.
pub struct NetworkNode {
    service: NetworkService,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkNode")
            .field("running", &self.service.is_running())
            .field("peers", &self.service.peer_count())
            .finish()
    }
}

impl NetworkNode {
    /// Build the swarm, start listening and spawn the worker.
    pub async fn start(
        config: NetworkConfig,
        chain: Arc<dyn ChainBackend>,
        sessions: Arc<dyn SessionInfoProvider>,
    ) -> Result<Self, NetworkError> {
        let keypair = match &config.node_key_path {
            Some(path) => load_or_generate_keypair(path)?,
            None => Keypair::generate_ed25519(),
        };
        let local_peer_id = keypair.public().to_peer_id();
        info!(%local_peer_id, "network: starting");

        let behaviour = build_behaviour(&keypair, &config)?;
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| NetworkError::Transport(format!("tcp: {e}")))?
            .with_dns()
            .map_err(|e| NetworkError::Transport(format!("dns: {e}")))?
            .with_behaviour(|_| behaviour)
            .map_err(|e| NetworkError::Transport(format!("behaviour: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let listen: Multiaddr = config
            .listen_multiaddr()
            .parse()
            .map_err(|e| NetworkError::Transport(format!("invalid listen address: {e}")))?;
        swarm
            .listen_on(listen)
            .map_err(|e| NetworkError::Transport(format!("listen: {e}")))?;

        let (worker, service) = NetworkWorker::new(config, local_peer_id, chain, sessions);
        let handle = tokio::spawn(worker.run(SwarmTransport::new(swarm)));
        Ok(Self { service, handle })
    }

    pub fn service(&self) -> &NetworkService {
        &self.service
    }

    pub fn local_peer_id(&self) -> PeerId {
        crate::service::NetworkStateInfo::local_peer_id(&self.service)
    }

    /// Stop the worker and wait for it to finish.
    pub async fn shutdown(self) {
        self.service.shutdown();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "network: worker task failed");
        }
    }
}
