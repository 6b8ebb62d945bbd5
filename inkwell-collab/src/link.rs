//! Per-remote signaling state machine.
//!
//! ```text
//!        initiate()                apply_answer() + ChannelOpen
//!  New ─────────────► Negotiating(Initiator) ──────────────┐
//!   │                                                      ▼
//!   │   accept_offer()                ChannelOpen      Connected ──► Closed
//!   └─────────────► Negotiating(Responder) ────────────────┘   close()/Closed
//!
//!  Negotiating | Connected ──(error)──► Failed
//! ```
//!
//! A link never talks to the relay itself: outbound offers, answers and
//! candidates are queued as [`Signal`]s and drained by the owning session.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use crate::protocol::{ClientMessage, IceCandidate, ParticipantId, SdpKind, SessionDescription};
use crate::transport::{PeerTransport, TransportError, TransportEvent};

/// Which side sent the first negotiation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Signaling state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating(Role),
    Connected,
    Closed,
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => f.write_str("new"),
            LinkState::Negotiating(Role::Initiator) => f.write_str("negotiating(initiator)"),
            LinkState::Negotiating(Role::Responder) => f.write_str("negotiating(responder)"),
            LinkState::Connected => f.write_str("connected"),
            LinkState::Closed => f.write_str("closed"),
            LinkState::Failed => f.write_str("failed"),
        }
    }
}

/// Negotiation artifact waiting to be sent to the remote over the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    /// Address the signal to `to`.
    pub fn into_message(self, to: ParticipantId) -> ClientMessage {
        match self {
            Signal::Offer(body) => ClientMessage::Offer { to, body },
            Signal::Answer(body) => ClientMessage::Answer { to, body },
            Signal::Candidate(body) => ClientMessage::Candidate { to, body },
        }
    }
}

/// Peer layer errors. They are logged by the session, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: ParticipantId, reason: String },
    #[error("transport to {peer} failed: {source}")]
    Transport {
        peer: ParticipantId,
        #[source]
        source: TransportError,
    },
    #[error("no link to {0}")]
    NoSuchLink(ParticipantId),
}

impl LinkError {
    fn from_transport(peer: ParticipantId, err: TransportError) -> Self {
        match err {
            TransportError::Negotiation(reason) => LinkError::Negotiation { peer, reason },
            source => LinkError::Transport { peer, source },
        }
    }
}

/// What happened to a received candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// No remote description yet, or the link is finished.
    Dropped,
}

/// Signaling relationship plus transport handle for one remote participant.
pub struct PeerLink<T> {
    remote: ParticipantId,
    conn: u64,
    role: Option<Role>,
    state: LinkState,
    transport: Option<T>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    outbound: VecDeque<Signal>,
}

impl<T: PeerTransport> PeerLink<T> {
    pub fn new(remote: ParticipantId, transport: T) -> Self {
        Self {
            remote,
            conn: transport.conn_id(),
            role: None,
            state: LinkState::New,
            transport: Some(transport),
            local_description: None,
            remote_description: None,
            outbound: VecDeque::new(),
        }
    }

    /// New → Negotiating(Initiator): create and queue an offer.
    pub fn initiate(&mut self) -> Result<(), LinkError> {
        self.expect_new("initiate")?;
        let offer = self.with_transport(|t| {
            let offer = t.create_offer()?;
            t.set_local_description(&offer)?;
            Ok(offer)
        })?;

        self.local_description = Some(offer.clone());
        self.role = Some(Role::Initiator);
        self.state = LinkState::Negotiating(Role::Initiator);
        self.outbound.push_back(Signal::Offer(offer));
        log::info!("Link to {}: sent offer", self.remote);
        Ok(())
    }

    /// New → Negotiating(Responder): apply the offer, create and queue an answer.
    pub fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), LinkError> {
        self.expect_new("accept offer")?;
        if offer.kind != SdpKind::Offer {
            return Err(self.fail_negotiation("expected an offer description"));
        }
        let answer = self.with_transport(|t| {
            t.set_remote_description(&offer)?;
            let answer = t.create_answer()?;
            t.set_local_description(&answer)?;
            Ok(answer)
        })?;

        self.remote_description = Some(offer);
        self.local_description = Some(answer.clone());
        self.role = Some(Role::Responder);
        self.state = LinkState::Negotiating(Role::Responder);
        self.outbound.push_back(Signal::Answer(answer));
        log::info!("Link to {}: answered offer", self.remote);
        Ok(())
    }

    /// Apply the remote answer to our offer.
    ///
    /// A redelivered identical answer is ignored; a different second answer
    /// fails the link.
    pub fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), LinkError> {
        if self.remote_description.as_ref() == Some(&answer) {
            log::debug!("Link to {}: duplicate answer ignored", self.remote);
            return Ok(());
        }
        match self.state {
            LinkState::Negotiating(Role::Initiator) if self.remote_description.is_none() => {}
            LinkState::Closed | LinkState::Failed => {
                return Err(LinkError::Negotiation {
                    peer: self.remote,
                    reason: format!("answer for {} link", self.state),
                });
            }
            LinkState::Negotiating(Role::Initiator) | LinkState::Connected => {
                return Err(self.fail_negotiation("answered twice"));
            }
            LinkState::New | LinkState::Negotiating(Role::Responder) => {
                return Err(self.fail_negotiation("unexpected answer"));
            }
        }
        if answer.kind != SdpKind::Answer {
            return Err(self.fail_negotiation("expected an answer description"));
        }

        self.with_transport(|t| t.set_remote_description(&answer))?;
        self.remote_description = Some(answer);
        log::debug!("Link to {}: remote answer applied", self.remote);
        Ok(())
    }

    /// Apply a remote candidate. Candidates that arrive before any remote
    /// description are dropped.
    pub fn apply_candidate(&mut self, candidate: &IceCandidate) -> Result<CandidateOutcome, LinkError> {
        if !self.is_live() || self.remote_description.is_none() {
            log::debug!(
                "Link to {} ({}): candidate dropped, no remote description",
                self.remote,
                self.state
            );
            return Ok(CandidateOutcome::Dropped);
        }
        self.with_transport(|t| t.add_ice_candidate(candidate))?;
        Ok(CandidateOutcome::Applied)
    }

    /// React to a transport event. Returns an inbound data message, if any.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Option<String> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.is_live() {
                    self.outbound.push_back(Signal::Candidate(candidate));
                }
                None
            }
            TransportEvent::ChannelOpen => {
                if let LinkState::Negotiating(_) = self.state {
                    self.state = LinkState::Connected;
                    log::info!("Link to {}: data channel open", self.remote);
                }
                None
            }
            TransportEvent::Message(payload) => {
                if self.state == LinkState::Connected {
                    Some(payload)
                } else {
                    log::debug!("Link to {} ({}): message dropped", self.remote, self.state);
                    None
                }
            }
            TransportEvent::Closed => {
                self.close();
                None
            }
            TransportEvent::Error(reason) => {
                self.fail(&reason);
                None
            }
        }
    }

    /// Send over the open data channel.
    pub fn send(&mut self, payload: &str) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::Transport {
                peer: self.remote,
                source: TransportError::ChannelNotOpen,
            });
        }
        self.with_transport(|t| t.send(payload))
    }

    /// Move to Closed and release the transport.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if self.state != LinkState::Closed {
            log::info!("Link to {} closed (was {})", self.remote, self.state);
            self.state = LinkState::Closed;
        }
        self.outbound.clear();
    }

    /// Move to Failed and release the transport.
    pub fn fail(&mut self, reason: &str) {
        log::warn!("Link to {} failed ({}): {reason}", self.remote, self.state);
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = LinkState::Failed;
        self.outbound.clear();
    }

    /// Take the queued outbound signals.
    pub fn drain_outbound(&mut self) -> impl Iterator<Item = Signal> + '_ {
        self.outbound.drain(..)
    }

    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    /// Connection attempt this link's transport events are tagged with.
    pub fn conn(&self) -> u64 {
        self.conn
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Negotiating or connected.
    pub fn is_live(&self) -> bool {
        matches!(self.state, LinkState::Negotiating(_) | LinkState::Connected)
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    fn expect_new(&self, action: &str) -> Result<(), LinkError> {
        if self.state == LinkState::New {
            Ok(())
        } else {
            Err(LinkError::Negotiation {
                peer: self.remote,
                reason: format!("cannot {action} from state {}", self.state),
            })
        }
    }

    fn fail_negotiation(&mut self, reason: &str) -> LinkError {
        self.fail(reason);
        LinkError::Negotiation {
            peer: self.remote,
            reason: reason.to_owned(),
        }
    }

    fn with_transport<R>(
        &mut self,
        f: impl FnOnce(&mut T) -> Result<R, TransportError>,
    ) -> Result<R, LinkError> {
        let remote = self.remote;
        let Some(transport) = self.transport.as_mut() else {
            return Err(LinkError::Transport {
                peer: remote,
                source: TransportError::Closed,
            });
        };
        f(transport).map_err(|e| {
            let err = LinkError::from_transport(remote, e);
            self.fail(&err.to_string());
            err
        })
    }
}

impl<T> fmt::Debug for PeerLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("conn", &self.conn)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("queued", &self.outbound.len())
            .finish()
    }
}
