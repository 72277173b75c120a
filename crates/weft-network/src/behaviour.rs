//! Composite libp2p [`NetworkBehaviour`] for Weft.
//!
//! All Weft protocols ride one request/response protocol ([`MUX_PROTOCOL`]);
//! the multiplexer demultiplexes them by name. Identify and optional mDNS
//! feed addresses to the peer set.

use crate::config::NetworkConfig;
use crate::protocol::{WeftCodec, MUX_PROTOCOL};
use libp2p::identity::Keypair;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, mdns, StreamProtocol};
use std::time::Duration;
use weft_core::error::NetworkError;

/// Protocol version string used in Identify.
pub const PROTOCOL_VERSION: &str = "/weft/1.0.0";

#[derive(NetworkBehaviour)]
pub struct WeftBehaviour {
    pub identify: identify::Behaviour,
    /// Local discovery; off on public networks.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub mux: request_response::Behaviour<WeftCodec>,
}

/// Timeout for libp2p's own request bookkeeping. Deadlines are enforced by
/// the multiplexer; this only has to outlast the longest of them.
fn transport_request_timeout(config: &NetworkConfig) -> Duration {
    [
        config.default_request_timeout(),
        config.sync.request_timeout(),
        config.dht.query_timeout(),
    ]
    .into_iter()
    .max()
    .unwrap_or_default()
        + Duration::from_secs(5)
}

pub fn build_behaviour(keypair: &Keypair, config: &NetworkConfig) -> Result<WeftBehaviour, NetworkError> {
    let local_peer_id = keypair.public().to_peer_id();

    let identify = identify::Behaviour::new(identify::Config::new(
        PROTOCOL_VERSION.to_string(),
        keypair.public(),
    ));

    let mdns = if config.enable_mdns {
        Some(
            mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                .map_err(|e| NetworkError::Transport(format!("mDNS: {e}")))?,
        )
    } else {
        None
    };

    let mux = request_response::Behaviour::with_codec(
        WeftCodec,
        [(StreamProtocol::new(MUX_PROTOCOL), ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(transport_request_timeout(config)),
    );

    Ok(WeftBehaviour {
        identify,
        mdns: mdns.into(),
        mux,
    })
}
