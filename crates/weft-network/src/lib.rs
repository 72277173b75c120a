//! # weft-network: P2P networking and chain synchronization.
//!
//! A single [`NetworkWorker`] event loop owns every piece of mutable network
//! state: the connection manager ([`PeerSet`]), peer reputation, the
//! protocol [`Multiplexer`], a Kademlia-style [`Dht`] and the
//! [`SyncCoordinator`] (warp, state, block and bitswap sync). Callers talk to
//! it through the cloneable [`NetworkService`].
//!
//! The worker never touches sockets. It consumes [`TransportEvent`]s and
//! emits [`TransportAction`]s; [`SwarmTransport`] maps those onto libp2p
//! (TCP + Noise + Yamux, Identify, optional mDNS), and [`NetworkNode::start`]
//! wires everything together.

pub mod behaviour;
pub mod config;
pub mod dht;
pub mod multiplexer;
pub mod network_state;
pub mod peerset;
pub mod protocol;
pub mod rate_limiter;
pub mod reputation;
pub mod request_handlers;
pub mod service;
pub mod session;
pub mod swarm;
pub mod sync;
pub mod transport;
pub mod worker;

pub use config::{DhtConfig, NetworkConfig, RateLimitConfig, ReputationConfig, SyncConfig};
pub use dht::{Dht, DhtEvent, DhtSubscription};
pub use multiplexer::{
    IfDisconnected, IncomingRequest, Multiplexer, NotificationEvent, NotificationSender, NotificationSenderReady,
    OutgoingResponse, ProtocolHandle, ProtocolKind,
};
pub use network_state::{NetworkState, NetworkStatus};
pub use peerset::{ConnectionState, PeerInfo, PeerSet};
pub use protocol::{ObservedRole, Status, WeftCodec};
pub use reputation::{ReputationChange, ReputationEngine};
pub use service::{NetworkService, NetworkStateInfo, Reply};
pub use swarm::{NetworkNode, SwarmTransport};
pub use sync::{SyncCoordinator, SyncMode, SyncState, SyncStatus};
pub use transport::{RequestId, Transport, TransportAction, TransportEvent};
pub use worker::{Command, Event, NetworkWorker};
