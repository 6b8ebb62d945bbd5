//! Relay room state.
//!
//! A room holds the roster, the presence map and the caret board of one
//! named room. Every inbound frame is turned into a list of addressed
//! [`Delivery`]s; the server only moves them over sockets.

use std::collections::BTreeMap;

use crate::caret::CaretReport;
use crate::presence::{color_for, PresenceDiff, PresenceEntry, PresenceMeta, PresenceState};
use crate::protocol::{ClientMessage, ParticipantId, ProtocolError, ServerMessage};

/// Room joined when a client does not name one.
pub const DEFAULT_ROOM: &str = "editor:lobby";

/// Who receives a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Only(ParticipantId),
    All,
    AllExcept(ParticipantId),
}

impl Audience {
    pub fn includes(&self, id: &ParticipantId) -> bool {
        match self {
            Audience::Only(to) => to == id,
            Audience::All => true,
            Audience::AllExcept(skip) => skip != id,
        }
    }
}

/// One frame for part of the room.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub audience: Audience,
    pub message: ServerMessage,
}

impl Delivery {
    fn only(to: ParticipantId, message: ServerMessage) -> Self {
        Self { audience: Audience::Only(to), message }
    }

    fn all(message: ServerMessage) -> Self {
        Self { audience: Audience::All, message }
    }

    fn all_except(skip: ParticipantId, message: ServerMessage) -> Self {
        Self { audience: Audience::AllExcept(skip), message }
    }
}

#[derive(Debug, Clone)]
struct Member {
    meta: PresenceMeta,
}

/// One named room.
#[derive(Debug)]
pub struct RoomState {
    name: String,
    limit: usize,
    echo_text_updates: bool,
    members: BTreeMap<ParticipantId, Member>,
    carets: BTreeMap<ParticipantId, CaretReport>,
    last_caret_stamp: u64,
    next_conn_ref: u64,
}

impl RoomState {
    pub fn new(name: impl Into<String>, limit: usize, echo_text_updates: bool) -> Self {
        Self {
            name: name.into(),
            limit,
            echo_text_updates,
            members: BTreeMap::new(),
            carets: BTreeMap::new(),
            last_caret_stamp: 0,
            next_conn_ref: 0,
        }
    }

    /// Admit `id` under `username`.
    pub fn join(&mut self, id: ParticipantId, username: &str) -> Result<Vec<Delivery>, ProtocolError> {
        if self.members.contains_key(&id) {
            return Err(ProtocolError::JoinRejected(format!("{id} already in {}", self.name)));
        }
        if self.members.len() >= self.limit {
            return Err(ProtocolError::RoomFull {
                room: self.name.clone(),
                limit: self.limit,
            });
        }

        self.next_conn_ref += 1;
        let meta = PresenceMeta {
            name: username.to_owned(),
            color: color_for(&id),
            conn_ref: format!("c{}", self.next_conn_ref),
        };
        self.members.insert(id, Member { meta: meta.clone() });
        log::info!("{username} ({id}) joined {} [{} present]", self.name, self.members.len());

        let peers = self.roster();
        let mut joins = PresenceState::new();
        joins.insert(id, PresenceEntry { metas: vec![meta] });

        let mut out = vec![
            Delivery::only(id, ServerMessage::Joined { socket_id: id, peers: peers.clone() }),
            Delivery::only(id, ServerMessage::PresenceState { state: self.presence() }),
            Delivery::all_except(id, ServerMessage::RosterUpdated { peers }),
            Delivery::all_except(
                id,
                ServerMessage::PresenceDiff {
                    diff: PresenceDiff { joins, leaves: PresenceState::new() },
                },
            ),
        ];
        if !self.carets.is_empty() {
            out.push(Delivery::only(
                id,
                ServerMessage::CaretPositions { carets: self.carets.clone() },
            ));
        }
        Ok(out)
    }

    /// Route a frame from a member. `now_ms` stamps caret updates.
    pub fn handle(&mut self, from: ParticipantId, msg: ClientMessage, now_ms: u64) -> Vec<Delivery> {
        if !self.members.contains_key(&from) {
            log::debug!("Frame from non-member {from} in {} dropped", self.name);
            return Vec::new();
        }

        match msg {
            ClientMessage::Join { .. } => {
                log::warn!("{from} sent join while already in {}", self.name);
                Vec::new()
            }
            ClientMessage::Offer { to, body } => {
                self.forward(from, to, ServerMessage::Offer { from, to, body })
            }
            ClientMessage::Answer { to, body } => {
                self.forward(from, to, ServerMessage::Answer { from, to, body })
            }
            ClientMessage::Candidate { to, body } => {
                self.forward(from, to, ServerMessage::Candidate { from, to, body })
            }
            ClientMessage::TextUpdated { op } => {
                let message = ServerMessage::TextUpdated { from, op };
                if self.echo_text_updates {
                    vec![Delivery::all(message)]
                } else {
                    vec![Delivery::all_except(from, message)]
                }
            }
            ClientMessage::Caret { position } => {
                let updated_at = now_ms.max(self.last_caret_stamp + 1);
                self.last_caret_stamp = updated_at;
                self.carets.insert(from, CaretReport { position, updated_at });
                log::trace!("Caret of {from} at {position} in {}", self.name);
                vec![Delivery::all(ServerMessage::CaretPositions {
                    carets: self.carets.clone(),
                })]
            }
            ClientMessage::Leave => self.leave(&from),
        }
    }

    /// Remove a participant. Unknown ids produce nothing.
    pub fn leave(&mut self, id: &ParticipantId) -> Vec<Delivery> {
        let Some(member) = self.members.remove(id) else {
            return Vec::new();
        };
        log::info!(
            "{} ({id}) left {} [{} present]",
            member.meta.name,
            self.name,
            self.members.len()
        );

        let mut leaves = PresenceState::new();
        leaves.insert(*id, PresenceEntry { metas: vec![member.meta] });

        let mut out = vec![
            Delivery::all(ServerMessage::RosterUpdated { peers: self.roster() }),
            Delivery::all(ServerMessage::PresenceDiff {
                diff: PresenceDiff { joins: PresenceState::new(), leaves },
            }),
        ];
        if self.carets.remove(id).is_some() {
            out.push(Delivery::all(ServerMessage::CaretPositions {
                carets: self.carets.clone(),
            }));
        }
        out
    }

    fn forward(&self, from: ParticipantId, to: ParticipantId, message: ServerMessage) -> Vec<Delivery> {
        if to == from || !self.members.contains_key(&to) {
            log::debug!("{} from {from} to unknown {to} dropped", message.event_name());
            return Vec::new();
        }
        vec![Delivery::only(to, message)]
    }

    /// Member ids, ordered.
    pub fn roster(&self) -> Vec<ParticipantId> {
        self.members.keys().copied().collect()
    }

    /// Full presence map.
    pub fn presence(&self) -> PresenceState {
        self.members
            .iter()
            .map(|(id, m)| (*id, PresenceEntry { metas: vec![m.meta.clone()] }))
            .collect()
    }

    pub fn caret_board(&self) -> &BTreeMap<ParticipantId, CaretReport> {
        &self.carets
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
