//! Wire message types for the Weft P2P protocol.
//!
//! Every logical protocol (built-in or registered at runtime) travels over a
//! single libp2p request-response protocol, [`MUX_PROTOCOL`]. The outer
//! envelope ([`WireRequest`] / [`WireResponse`]) names the logical protocol;
//! its payload is opaque to the transport. Built-in payloads are bincode,
//! never JSON.

use serde::{Deserialize, Serialize};
use weft_core::error::NetworkError;
use weft_core::types::{Block, BlockHeader, BlockNumber, Hash256};

/// The libp2p stream protocol carrying all logical protocols.
pub const MUX_PROTOCOL: &str = "/weft/mux/1";
/// Status handshake (request-response).
pub const STATUS_PROTOCOL: &str = "/weft/status/1";
/// New best block announcements (notifications).
pub const BLOCK_ANNOUNCES_PROTOCOL: &str = "/weft/block-announces/1";
/// Block range download.
pub const BLOCKS_PROTOCOL: &str = "/weft/sync/blocks/1";
/// State chunk download.
pub const STATE_PROTOCOL: &str = "/weft/sync/state/1";
/// Warp proof download.
pub const WARP_PROTOCOL: &str = "/weft/sync/warp/1";
/// Content-addressed data fetch.
pub const BITSWAP_PROTOCOL: &str = "/weft/bitswap/1";
/// DHT queries.
pub const KAD_PROTOCOL: &str = "/weft/kad/1";

/// Protocols served by the network layer itself.
pub const BUILTIN_PROTOCOLS: &[&str] = &[
    STATUS_PROTOCOL,
    BLOCK_ANNOUNCES_PROTOCOL,
    BLOCKS_PROTOCOL,
    STATE_PROTOCOL,
    WARP_PROTOCOL,
    BITSWAP_PROTOCOL,
    KAD_PROTOCOL,
];

/// Maximum encoded request envelope (notification batches included).
pub const MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

/// Maximum encoded response envelope (block ranges, state chunks, proofs).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub fn is_builtin(protocol: &str) -> bool {
    BUILTIN_PROTOCOLS.contains(&protocol)
}

/// Role a node advertises in its status handshake.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum ObservedRole {
    Full,
    Light,
    Authority,
}

/// Envelope sent over [`MUX_PROTOCOL`].
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireRequest {
    /// A batch of notifications, delivered in order. Acknowledged with
    /// [`WireResponse::Ack`].
    Notifications { protocol: String, payloads: Vec<Vec<u8>> },
    /// A single request expecting a response.
    Request { protocol: String, payload: Vec<u8> },
}

impl WireRequest {
    pub fn protocol(&self) -> &str {
        match self {
            WireRequest::Notifications { protocol, .. } | WireRequest::Request { protocol, .. } => protocol,
        }
    }

    /// Bytes of user payload carried.
    pub fn payload_len(&self) -> usize {
        match self {
            WireRequest::Notifications { payloads, .. } => payloads.iter().map(Vec::len).sum(),
            WireRequest::Request { payload, .. } => payload.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireResponse {
    Ack,
    Response(Vec<u8>),
    /// The handler declined to answer (rate limit, missing data, busy).
    Refused,
    /// The remote has no handler for the protocol.
    UnknownProtocol,
}

impl WireResponse {
    pub fn payload_len(&self) -> usize {
        match self {
            WireResponse::Response(payload) => payload.len(),
            _ => 0,
        }
    }
}

/// Status handshake, exchanged in both directions on every new connection
/// and again when the local protocol set changes.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Status {
    pub genesis_hash: Hash256,
    pub role: ObservedRole,
    pub best_number: BlockNumber,
    pub best_hash: Hash256,
    pub finalized_number: BlockNumber,
    pub finalized_hash: Hash256,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockAnnounce {
    pub header: BlockHeader,
}

/// Request `count` consecutive blocks starting at `from`.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockRequest {
    pub from: BlockNumber,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockResponse {
    pub blocks: Vec<Block>,
}

/// Request state at `block` with keys strictly after `start_key`.
/// The response is a [`weft_core::types::StateChunk`].
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct StateRequest {
    pub block: Hash256,
    pub start_key: Vec<u8>,
    pub max_entries: u32,
}

/// Request set-change fragments after `begin`.
/// The response is a [`weft_core::types::WarpProof`].
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct WarpRequest {
    pub begin: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BitswapRequest {
    pub cid: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BitswapResponse {
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum DhtRequest {
    FindNode { key: Vec<u8> },
    GetValue { key: Vec<u8> },
    PutValue { key: Vec<u8>, value: Vec<u8> },
}

/// A routing table entry shared with other peers.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DhtPeer {
    /// Multihash bytes of the peer id.
    pub peer_id: Vec<u8>,
    /// Multiaddresses as strings.
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct DhtResponse {
    pub record: Option<Vec<u8>>,
    pub closer_peers: Vec<DhtPeer>,
    /// A `PutValue` was accepted.
    pub stored: bool,
}

type DecodeConfig = bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Varint,
    bincode::config::Limit<MAX_MESSAGE_SIZE>,
>;

/// Length prefixes are checked against the limit before anything is
/// allocated for them.
fn decode_config() -> DecodeConfig {
    bincode::config::standard().with_limit::<MAX_MESSAGE_SIZE>()
}

/// Encode a payload with bincode, enforcing [`MAX_MESSAGE_SIZE`].
pub fn encode_message<T: bincode::Encode>(msg: &T) -> Result<Vec<u8>, NetworkError> {
    let buf = bincode::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| NetworkError::Codec(e.to_string()))?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge {
            size: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(buf)
}

/// Decode a bincode payload.
///
/// Returns `None` if the data is oversized, malformed, or has trailing bytes.
pub fn decode_message<T: bincode::Decode<()>>(data: &[u8]) -> Option<T> {
    if data.len() > MAX_MESSAGE_SIZE {
        return None;
    }
    let (msg, read): (T, usize) = bincode::decode_from_slice(data, decode_config()).ok()?;
    (read == data.len()).then_some(msg)
}

/// Codec for [`MUX_PROTOCOL`].
/// Uses 4-byte length prefix + bincode payload.
#[derive(Debug, Clone, Default)]
pub struct WeftCodec;

fn invalid_data(msg: impl ToString) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

async fn read_framed<T, M>(io: &mut T, max: usize) -> std::io::Result<M>
where
    T: libp2p::futures::AsyncRead + Unpin + Send,
    M: bincode::Decode<()>,
{
    use libp2p::futures::AsyncReadExt;
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(invalid_data(format!("frame too large: {len} > {max}")));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    let (msg, _): (M, usize) =
        bincode::decode_from_slice(&buf, decode_config()).map_err(invalid_data)?;
    Ok(msg)
}

async fn write_framed<T, M>(io: &mut T, msg: &M, max: usize) -> std::io::Result<()>
where
    T: libp2p::futures::AsyncWrite + Unpin + Send,
    M: bincode::Encode,
{
    use libp2p::futures::AsyncWriteExt;
    let buf = bincode::encode_to_vec(msg, bincode::config::standard()).map_err(invalid_data)?;
    if buf.len() > max {
        return Err(invalid_data(format!("frame too large: {} > {max}", buf.len())));
    }
    io.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await
}

#[async_trait::async_trait]
impl libp2p::request_response::Codec for WeftCodec {
    type Protocol = libp2p::StreamProtocol;
    type Request = WireRequest;
    type Response = WireResponse;

    async fn read_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> std::io::Result<Self::Request>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        read_framed(io, MAX_REQUEST_SIZE).await
    }

    async fn read_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> std::io::Result<Self::Response>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        read_framed(io, MAX_MESSAGE_SIZE).await
    }

    async fn write_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T, req: Self::Request) -> std::io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req, MAX_REQUEST_SIZE).await
    }

    async fn write_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T, resp: Self::Response) -> std::io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp, MAX_MESSAGE_SIZE).await
    }
}
