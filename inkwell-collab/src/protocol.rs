//! Relay channel wire protocol.
//!
//! Every frame is a JSON object tagged by event name:
//! ```text
//! { "event": "offer", "payload": { "to": "<id>", "body": { "type": "offer", "sdp": "…" } } }
//! ```
//!
//! Client → relay frames are [`ClientMessage`]; relay → client frames are
//! [`ServerMessage`]. Point-to-point events carry `to`, and the relay stamps
//! `from` before forwarding. Both directions are closed enums so every
//! component dispatches with an exhaustive `match`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::caret::CaretReport;
use crate::operation::Edit;
use crate::presence::{PresenceDiff, PresenceState};

/// Opaque session identifier assigned by the relay on join.
///
/// Ordering is byte-wise on the underlying UUID and is used as the
/// deterministic tie-break when two participants offer to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// A network candidate for the direct transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Frames pushed by a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room under a display name.
    Join { room: String, username: String },
    Offer { to: ParticipantId, body: SessionDescription },
    Answer { to: ParticipantId, body: SessionDescription },
    Candidate { to: ParticipantId, body: IceCandidate },
    /// Edit relayed through the server (relayed replication mode).
    TextUpdated { op: Edit },
    /// Local caret position sample.
    Caret { position: usize },
    /// Clean departure.
    Leave,
}

/// Frames delivered by the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join acknowledgment with the roster at join time.
    Joined {
        socket_id: ParticipantId,
        peers: Vec<ParticipantId>,
    },
    JoinRejected { reason: String },
    RosterUpdated { peers: Vec<ParticipantId> },
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        body: SessionDescription,
    },
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        body: SessionDescription,
    },
    Candidate {
        from: ParticipantId,
        to: ParticipantId,
        body: IceCandidate,
    },
    PresenceState { state: PresenceState },
    PresenceDiff { diff: PresenceDiff },
    TextUpdated { from: ParticipantId, op: Edit },
    /// Full, recomputed caret board for the room.
    CaretPositions {
        carets: BTreeMap<ParticipantId, CaretReport>,
    },
}

impl ServerMessage {
    /// Recipient of a point-to-point event, `None` for room-wide events.
    pub fn addressee(&self) -> Option<ParticipantId> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => {
                Some(*to)
            }
            _ => None,
        }
    }

    /// Event name as it appears on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::JoinRejected { .. } => "join_rejected",
            Self::RosterUpdated { .. } => "roster_updated",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::PresenceState { .. } => "presence_state",
            Self::PresenceDiff { .. } => "presence_diff",
            Self::TextUpdated { .. } => "text_updated",
            Self::CaretPositions { .. } => "caret_positions",
        }
    }
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to a JSON text frame.
            pub fn encode(&self) -> Result<String, ProtocolError> {
                serde_json::to_string(self)
                    .map_err(|e| ProtocolError::SerializationError(e.to_string()))
            }

            /// Deserialize from a JSON text frame.
            pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
                serde_json::from_str(frame)
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
            }
        }
    };
}

json_codec!(ClientMessage);
json_codec!(ServerMessage);

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Join rejected: {0}")]
    JoinRejected(String),
    #[error("Room {room} is full ({limit} participants)")]
    RoomFull { room: String, limit: usize },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
