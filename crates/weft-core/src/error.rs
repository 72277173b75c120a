//! Error types for the Weft networking and sync stack.
use thiserror::Error;

/// Why an outbound connection attempt was rejected or failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("address unreachable: {0}")] Unreachable(String),
    #[error("handshake failed: {0}")] Handshake(String),
    #[error("unsupported protocol: {0}")] UnsupportedProtocol(String),
    #[error("no known address for peer")] NoAddresses,
    #[error("peer is banned or within its redial cooldown")] Banned,
    #[error("peer already connected or connecting")] AlreadyConnected,
    #[error("refusing to dial the local peer")] LocalPeer,
    #[error("peer slots full")] TooManyPeers,
    #[error("peer is not reserved and reserved-only mode is on")] NotReserved,
}

/// Transport-level reason an outbound request did not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundFailure {
    #[error("dial failure")] DialFailure,
    #[error("timeout")] Timeout,
    #[error("connection closed")] ConnectionClosed,
    #[error("unsupported protocols")] UnsupportedProtocols,
}

/// Error surfaced to the caller of a request/response exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("peer not connected")] NotConnected,
    #[error("unknown protocol")] UnknownProtocol,
    #[error("remote refused the request")] Refused,
    #[error("superseded by a newer request")] Obsolete,
    #[error("network: {0}")] Network(#[from] OutboundFailure),
}

/// Failure to reserve or use a notification slot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationError {
    #[error("peer not connected on this protocol")] NotConnected,
    #[error("outbound notification queue full")] QueueFull,
    #[error("unknown protocol")] UnknownProtocol,
    #[error("protocol is not a notification protocol")] WrongKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("protocol already registered: {0}")] AlreadyRegistered(String),
    #[error("invalid protocol name: {0}")] InvalidName(String),
}

/// Rejection of downloaded chain data by the local backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("unknown parent for block {0}")] UnknownParent(u64),
    #[error("non-contiguous import: expected {expected}, got {got}")] NonContiguous { expected: u64, got: u64 },
    #[error("body does not match header at block {0}")] InvalidBody(u64),
    #[error("state root mismatch")] StateRootMismatch,
    #[error("unknown block: {0}")] UnknownBlock(String),
    #[error("backend: {0}")] Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signer is not a member of the authority set")] UnknownAuthority,
    #[error("insufficient signatures: got {got}, need {needed}")] InsufficientSignatures { got: usize, needed: usize },
    #[error("empty authority set")] EmptyAuthoritySet,
}

/// Session-cache errors after which the current sync attempt must stop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalSessionError {
    #[error("session provider shut down")] ProviderShutdown,
    #[error("session request canceled")] Canceled,
}

/// Session-cache errors that may succeed with a different relay point.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonFatalSessionError {
    #[error("no such session: {0}")] NoSuchSession(u64),
    #[error("unknown relay point: {0}")] UnknownRelayPoint(String),
    #[error("session request failed: {0}")] Request(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("fatal: {0}")] Fatal(#[from] FatalSessionError),
    #[error("non-fatal: {0}")] NonFatal(#[from] NonFatalSessionError),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Fatal(_))
    }
}

/// Verification failure of a warp-sync proof.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarpProofError {
    #[error("empty proof")] Empty,
    #[error("fragment at {number} signed by set {got}, expected {expected}")] SetMismatch { number: u64, expected: u64, got: u64 },
    #[error("fragments not strictly ascending at {0}")] NotAscending(u64),
    #[error("missing justification at {0}")] MissingJustification(u64),
    #[error("bad justification at {number}: {source}")] Justification { number: u64, source: CryptoError },
    #[error("session: {0}")] Session(#[from] SessionError),
    #[error("finished proof does not end at the agreed target")] TargetMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitswapError {
    #[error("content not found on any peer")] NotFound,
    #[error("no peers available")] NoPeers,
    #[error("request canceled")] Canceled,
}

/// Errors surfaced by the network service handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network worker stopped")] WorkerStopped,
    #[error("codec: {0}")] Codec(String),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("node key: {0}")] NodeKey(String),
    #[error("transport: {0}")] Transport(String),
    #[error(transparent)] Registration(#[from] RegistrationError),
    #[error(transparent)] Dial(#[from] DialError),
}

#[derive(Error, Debug)]
pub enum WeftError {
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Request(#[from] RequestFailure),
    #[error(transparent)] Notification(#[from] NotificationError),
    #[error(transparent)] Import(#[from] ImportError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Session(#[from] SessionError),
    #[error(transparent)] WarpProof(#[from] WarpProofError),
    #[error(transparent)] Bitswap(#[from] BitswapError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_failure_lifts_into_request_failure() {
        let failure: RequestFailure = OutboundFailure::Timeout.into();
        assert_eq!(failure, RequestFailure::Network(OutboundFailure::Timeout));
        assert_eq!(failure.to_string(), "network: timeout");
    }

    #[test]
    fn session_error_classification() {
        let fatal: SessionError = FatalSessionError::ProviderShutdown.into();
        let non_fatal: SessionError = NonFatalSessionError::NoSuchSession(4).into();
        assert!(fatal.is_fatal());
        assert!(!non_fatal.is_fatal());
    }

    #[test]
    fn warp_error_wraps_session_error() {
        let err: WarpProofError = SessionError::from(FatalSessionError::Canceled).into();
        assert!(matches!(err, WarpProofError::Session(SessionError::Fatal(_))));
    }
}
