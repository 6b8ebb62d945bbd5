//! Seam to the peer-transport library.
//!
//! The library owns connection bootstrap (NAT traversal, the reliable
//! ordered data channel). The session only drives it through
//! [`PeerTransport`] and hears back through [`PeerEvent`]s: a
//! [`TransportEvent`] tagged with the remote participant id and the
//! connection attempt that produced it.
//!
//! ```text
//! Session ──create/set/add/send──► PeerTransport
//!    ▲                                  │
//!    └── PeerEvent{peer, conn, event} ◄─┘
//! ```

pub mod memory;

use thiserror::Error;

use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};

pub use memory::{MemoryEndpoint, MemoryNetwork, MemoryTransport};

/// Events reported by a transport for one remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local network candidate is ready to be signaled.
    LocalCandidate(IceCandidate),
    /// The data channel is open.
    ChannelOpen,
    /// A data channel message from the remote participant.
    Message(String),
    /// The channel closed.
    Closed,
    /// The transport failed.
    Error(String),
}

/// A transport event as delivered to the host.
///
/// `conn` identifies the connection attempt, so events from a transport
/// that was already replaced can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: ParticipantId,
    pub conn: u64,
    pub event: TransportEvent,
}

/// Errors surfaced by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("transport closed")]
    Closed,
    #[error("direct transport unavailable")]
    Unavailable,
}

/// One direct connection attempt to a remote participant.
pub trait PeerTransport {
    /// Identity of this connection attempt, carried by its [`PeerEvent`]s.
    fn conn_id(&self) -> u64;

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    /// Requires the remote offer to have been applied.
    fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), TransportError>;

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), TransportError>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Send over the open data channel.
    fn send(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Release the connection. Idempotent.
    fn close(&mut self);
}

/// Creates transports towards remote participants.
pub trait TransportFactory {
    type Transport: PeerTransport;

    fn open(&mut self, remote: ParticipantId) -> Result<Self::Transport, TransportError>;
}

/// Factory for hosts without a direct transport (relayed mode).
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

/// Transport type of [`Unavailable`]; it can never be constructed.
#[derive(Debug)]
pub enum NoTransport {}

impl TransportFactory for Unavailable {
    type Transport = NoTransport;

    fn open(&mut self, _remote: ParticipantId) -> Result<NoTransport, TransportError> {
        Err(TransportError::Unavailable)
    }
}

impl PeerTransport for NoTransport {
    fn conn_id(&self) -> u64 {
        match *self {}
    }

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        match *self {}
    }

    fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        match *self {}
    }

    fn set_local_description(&mut self, _: &SessionDescription) -> Result<(), TransportError> {
        match *self {}
    }

    fn set_remote_description(&mut self, _: &SessionDescription) -> Result<(), TransportError> {
        match *self {}
    }

    fn add_ice_candidate(&mut self, _: &IceCandidate) -> Result<(), TransportError> {
        match *self {}
    }

    fn send(&mut self, _: &str) -> Result<(), TransportError> {
        match *self {}
    }

    fn close(&mut self) {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_refuses() {
        let mut factory = Unavailable;
        assert_eq!(
            factory.open(ParticipantId::new()).err(),
            Some(TransportError::Unavailable)
        );
    }
}
