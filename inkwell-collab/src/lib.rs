//! # inkwell-collab: peer sessions and edit replication for a shared text editor
//!
//! Participants join a room on a relay server, open a direct link to every
//! other participant, and replicate single-character edits over those
//! links (or through the relay). Presence and remote carets ride the relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │ RelayClient  │ ◄──────────────────► │ RelayServer  │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐  offer/answer/cand.  ┌──────────────┐
//! │ Session      │ ◄── via relay ─────► │ RoomState    │
//! │  PeerLinks ──┼─ data channel ─┐     │ (roster,     │
//! │  Replication │                │     │  presence,   │
//! │  Presence    │                ▼     │  carets)     │
//! │  Carets      │           other      └──────────────┘
//! └──────────────┘           sessions
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Relay frames (JSON, `event` + `payload`)
//! - [`operation`]: Character operations and the document surface
//! - [`membership`]: Roster diffing
//! - [`link`]: Per-remote signaling state machine
//! - [`transport`]: Peer-transport seam and the in-memory network
//! - [`replication`]: Stamping, echo suppression, dedup
//! - [`presence`]: Presence snapshot/diff tracking
//! - [`caret`]: Remote carets with decay
//! - [`session`]: The single-owner participant state machine
//! - [`runner`]: Async host for a session
//! - [`room`], [`broadcast`], [`server`]: The relay
//! - [`client`]: WebSocket relay client

pub mod broadcast;
pub mod caret;
pub mod client;
pub mod link;
pub mod membership;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod replication;
pub mod room;
pub mod runner;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, Room, RoomManager};
pub use caret::{CaretOverlay, CaretReport, CaretTracker, DecayTimer, CARET_DECAY};
pub use client::{ConnectionState, Joined, RelayClient, RelayEvent, RelaySender};
pub use link::{LinkError, LinkState, PeerLink, Role, Signal};
pub use membership::{MembershipReconciler, RosterDiff};
pub use operation::{DocumentSurface, Edit, InputEvent, Operation, OperationError, TextBuffer};
pub use presence::{PresenceDiff, PresenceState, PresenceTracker, PresenceView};
pub use protocol::{
    ClientMessage, IceCandidate, ParticipantId, ProtocolError, SdpKind, ServerMessage,
    SessionDescription,
};
pub use replication::{Applied, ReplicationEngine, ReplicationMode};
pub use room::{Audience, Delivery, RoomState, DEFAULT_ROOM};
pub use runner::{DecayTimers, LocalCommand, SessionHandle, SessionRunner};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{Effect, Keystroke, RenderUpdate, Session, SessionConfig, SessionEvent};
pub use transport::{
    MemoryNetwork, PeerTransport, TransportError, TransportEvent, TransportFactory, Unavailable,
};
