//! The seam between the network worker and the wire.
//!
//! The worker is a state machine: it consumes [`TransportEvent`]s and emits
//! [`TransportAction`]s. [`crate::swarm::SwarmTransport`] maps both onto a
//! libp2p swarm; tests route them between in-memory workers instead.

use libp2p::{Multiaddr, PeerId};
use std::fmt;
use weft_core::error::OutboundFailure;

use crate::protocol::{WireRequest, WireResponse};

/// Identifier of a request on the multiplexed protocol.
///
/// Outbound ids are allocated by the worker. Inbound ids are allocated by
/// the transport and only ever echoed back in [`TransportAction::SendResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the worker wants the transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportAction {
    Dial { peer: PeerId, addresses: Vec<Multiaddr> },
    Disconnect { peer: PeerId },
    SendRequest { peer: PeerId, request_id: RequestId, request: WireRequest },
    SendResponse { request_id: RequestId, response: WireResponse },
}

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionEstablished { peer: PeerId, address: Option<Multiaddr>, inbound: bool },
    ConnectionClosed { peer: PeerId },
    DialFailure { peer: PeerId, error: String },
    InboundRequest { peer: PeerId, request_id: RequestId, request: WireRequest },
    Response { peer: PeerId, request_id: RequestId, result: Result<WireResponse, OutboundFailure> },
    /// An address learned out of band (mDNS, Identify).
    AddressDiscovered { peer: PeerId, address: Multiaddr },
    NewListenAddr(Multiaddr),
}

/// Drives the wire on behalf of a [`crate::worker::NetworkWorker`].
#[async_trait::async_trait]
pub trait Transport: Send {
    fn apply(&mut self, action: TransportAction);

    /// The next event, or `None` once the transport has shut down.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}
