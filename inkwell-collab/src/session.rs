//! The participant session: one owner for all replication state.
//!
//! Every input (relay frame, transport event, local keystroke, caret timer)
//! is a [`SessionEvent`] handled to completion before the next one, so no
//! state here is shared or locked. Outputs are queued as [`Effect`]s for the
//! host to carry out: frames to push to the relay, render updates, and
//! caret timer instructions.
//!
//! ```text
//!  relay ─┐                       ┌─► Effect::Relay   ─► relay
//!  peers ─┼─► Session::handle() ──┼─► Effect::Render  ─► rendering collaborator
//!  input ─┘      │                └─► Effect::Timer   ─► decay scheduler
//!                ├─ MembershipReconciler
//!                ├─ PeerLink per remote id
//!                ├─ ReplicationEngine ⇄ DocumentSurface
//!                ├─ PresenceTracker
//!                └─ CaretTracker
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use crate::caret::{CaretOverlay, CaretReport, CaretTracker, DecayTimer, CARET_DECAY};
use crate::link::{LinkError, LinkState, PeerLink, Role};
use crate::membership::MembershipReconciler;
use crate::operation::{DocumentSurface, Edit, InputEvent, Operation};
use crate::presence::{PresenceTracker, PresenceView};
use crate::protocol::{
    ClientMessage, IceCandidate, ParticipantId, ServerMessage, SessionDescription,
};
use crate::replication::{Applied, ReplicationEngine, ReplicationMode};
use crate::transport::{TransportEvent, TransportFactory};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How edits reach other participants
    pub mode: ReplicationMode,
    /// Inactivity window before a remote caret fades
    pub caret_decay: Duration,
    /// Remote edit ids remembered per sender for dedup
    pub dedup_window: usize,
    /// Display name announced on join
    pub username: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Mesh,
            caret_decay: CARET_DECAY,
            dedup_window: 256,
            username: "anonymous".to_string(),
        }
    }
}

/// A keystroke on the session's own document surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keystroke {
    Char { cursor: usize, ch: char },
    /// Type at the end of the text, wherever that is when handled.
    Append { ch: char },
    Backspace { cursor: usize },
}

/// Everything the session reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A frame from the relay channel.
    Relay(ServerMessage),
    /// An event from connection attempt `conn` towards `peer`.
    Transport {
        peer: ParticipantId,
        conn: u64,
        event: TransportEvent,
    },
    /// The document surface already applied a local change.
    LocalInput(InputEvent),
    /// A keystroke to apply to the session's document surface.
    LocalKeystroke(Keystroke),
    /// Local caret sample (click, key-up, input).
    LocalCaret { position: usize },
    /// A caret decay timer fired.
    CaretExpired {
        participant: ParticipantId,
        generation: u64,
    },
}

/// Updates for the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderUpdate {
    Document(String),
    Presence(Vec<PresenceView>),
    Carets(Vec<CaretOverlay>),
}

/// Work the host performs on the session's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Relay(ClientMessage),
    Render(RenderUpdate),
    Timer(DecayTimer),
}

/// A participant's replication session.
pub struct Session<F: TransportFactory, D> {
    config: SessionConfig,
    local: ParticipantId,
    factory: F,
    document: D,
    membership: MembershipReconciler,
    links: HashMap<ParticipantId, PeerLink<F::Transport>>,
    replication: ReplicationEngine,
    presence: PresenceTracker,
    carets: CaretTracker,
    effects: VecDeque<Effect>,
}

impl<F: TransportFactory, D: DocumentSurface> Session<F, D> {
    pub fn new(local: ParticipantId, config: SessionConfig, factory: F, document: D) -> Self {
        Self {
            membership: MembershipReconciler::new(local),
            replication: ReplicationEngine::new(local, config.dedup_window),
            carets: CaretTracker::new(local, config.caret_decay),
            presence: PresenceTracker::new(),
            links: HashMap::new(),
            effects: VecDeque::new(),
            config,
            local,
            factory,
            document,
        }
    }

    /// Handle one event to completion.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Relay(msg) => self.on_relay(msg),
            SessionEvent::Transport { peer, conn, event } => self.on_transport(peer, conn, event),
            SessionEvent::LocalInput(input) => self.on_local_input(input),
            SessionEvent::LocalKeystroke(key) => self.on_keystroke(key),
            SessionEvent::LocalCaret { position } => {
                self.effects.push_back(Effect::Relay(ClientMessage::Caret { position }));
            }
            SessionEvent::CaretExpired { participant, generation } => {
                if self.carets.expire(&participant, generation) {
                    self.render_carets();
                }
            }
        }
        self.flush_signals();
    }

    /// Take the effects queued so far, in order.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    /// Send a local edit that the document surface has already applied.
    pub fn submit_local_edit(&mut self, op: Operation) -> Edit {
        let edit = self.replication.stamp(op);
        match self.config.mode {
            ReplicationMode::Mesh => {
                let payload = match edit.to_json() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Failed to encode local edit: {e}");
                        return edit;
                    }
                };
                for link in self.links.values_mut().filter(|l| l.is_connected()) {
                    if let Err(e) = link.send(&payload) {
                        log::warn!("{e}");
                    }
                }
            }
            ReplicationMode::Relayed => {
                self.effects
                    .push_back(Effect::Relay(ClientMessage::TextUpdated { op: edit }));
            }
        }
        edit
    }

    /// Apply an edit from `sender` unless it is our own echo.
    pub fn on_remote_operation(&mut self, sender: ParticipantId, edit: &Edit) -> Applied {
        let outcome = self.replication.apply_remote(sender, edit, &mut self.document);
        if outcome == Applied::Changed {
            self.render_document();
        }
        outcome
    }

    /// Close every link and announce departure.
    pub fn shutdown(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close();
        }
        self.effects.push_back(Effect::Relay(ClientMessage::Leave));
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn roster(&self) -> &BTreeSet<ParticipantId> {
        self.membership.roster()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn carets(&self) -> &CaretTracker {
        &self.carets
    }

    pub fn link_state(&self, peer: &ParticipantId) -> Option<LinkState> {
        self.links.get(peer).map(|l| l.state())
    }

    pub fn link_role(&self, peer: &ParticipantId) -> Option<Role> {
        self.links.get(peer).and_then(|l| l.role())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Remote ids with an open data channel, ordered.
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<_> = self
            .links
            .values()
            .filter(|l| l.is_connected())
            .map(|l| l.remote())
            .collect();
        peers.sort();
        peers
    }

    // ── relay ──────────────────────────────────────────────────────

    fn on_relay(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Joined { socket_id, peers } => {
                if socket_id == self.local {
                    self.on_roster(peers);
                } else {
                    log::warn!("Join acknowledgment for {socket_id}, we are {}", self.local);
                }
            }
            ServerMessage::JoinRejected { reason } => {
                log::warn!("Relay rejected join: {reason}");
            }
            ServerMessage::RosterUpdated { peers } => self.on_roster(peers),
            ServerMessage::Offer { from, to, body } => {
                if to == self.local {
                    self.on_offer(from, body);
                }
            }
            ServerMessage::Answer { from, to, body } => {
                if to == self.local {
                    self.on_answer(from, body);
                }
            }
            ServerMessage::Candidate { from, to, body } => {
                if to == self.local {
                    self.on_candidate(from, &body);
                }
            }
            ServerMessage::PresenceState { state } => {
                self.presence.sync_state(&state);
                self.render_presence();
            }
            ServerMessage::PresenceDiff { diff } => {
                self.presence.sync_diff(&diff);
                self.render_presence();
            }
            ServerMessage::TextUpdated { from, op } => {
                self.on_remote_operation(from, &op);
            }
            ServerMessage::CaretPositions { carets } => self.on_caret_board(&carets),
        }
    }

    fn on_roster(&mut self, peers: Vec<ParticipantId>) {
        let diff = self.membership.reconcile(peers);
        if diff.is_empty() {
            return;
        }
        log::info!(
            "Roster changed: {} joined, {} left",
            diff.joined.len(),
            diff.left.len()
        );

        let mut carets_changed = false;
        for id in &diff.left {
            if let Err(e) = self.teardown(id) {
                log::debug!("Teardown skipped: {e}");
            }
            self.replication.forget(id);
            if let Some(timer) = self.carets.remove(id) {
                self.effects.push_back(Effect::Timer(timer));
                carets_changed = true;
            }
        }
        if carets_changed {
            self.render_carets();
        }
        if self.config.mode == ReplicationMode::Mesh {
            for id in diff.joined {
                self.connect(id);
            }
        }
    }

    fn connect(&mut self, remote: ParticipantId) {
        if let Some(link) = self.links.get(&remote) {
            if link.is_live() {
                log::debug!("Link to {remote} already {}", link.state());
                return;
            }
        }
        if let Some(mut stale) = self.links.remove(&remote) {
            stale.close();
        }

        match self.factory.open(remote) {
            Ok(transport) => {
                let mut link = PeerLink::new(remote, transport);
                if let Err(e) = link.initiate() {
                    log::warn!("{e}");
                }
                self.links.insert(remote, link);
            }
            Err(e) => log::warn!("Cannot open transport to {remote}: {e}"),
        }
    }

    fn teardown(&mut self, remote: &ParticipantId) -> Result<(), LinkError> {
        let mut link = self
            .links
            .remove(remote)
            .ok_or(LinkError::NoSuchLink(*remote))?;
        link.close();
        Ok(())
    }

    fn on_offer(&mut self, from: ParticipantId, offer: SessionDescription) {
        if self.config.mode == ReplicationMode::Relayed {
            log::debug!("Offer from {from} ignored in relayed mode");
            return;
        }

        if let Some(link) = self.links.get(&from) {
            match link.state() {
                // Both sides offered. The smaller id stays initiator.
                LinkState::Negotiating(Role::Initiator) if self.local < from => {
                    log::info!("Offer collision with {from}: keeping initiator role");
                    return;
                }
                LinkState::Negotiating(Role::Responder) | LinkState::Connected
                    if link.remote_description() == Some(&offer) =>
                {
                    log::debug!("Duplicate offer from {from} ignored");
                    return;
                }
                state => log::info!("Offer from {from} replaces {state} link"),
            }
        }
        if let Some(mut old) = self.links.remove(&from) {
            old.close();
        }

        match self.factory.open(from) {
            Ok(transport) => {
                let mut link = PeerLink::new(from, transport);
                if let Err(e) = link.accept_offer(offer) {
                    log::warn!("{e}");
                }
                self.links.insert(from, link);
            }
            Err(e) => log::warn!("Cannot open transport to {from}: {e}"),
        }
    }

    fn on_answer(&mut self, from: ParticipantId, answer: SessionDescription) {
        let Some(link) = self.links.get_mut(&from) else {
            log::debug!("Answer from {from} without a link dropped");
            return;
        };
        if let Err(e) = link.apply_answer(answer) {
            log::warn!("{e}");
        }
    }

    fn on_candidate(&mut self, from: ParticipantId, candidate: &IceCandidate) {
        let Some(link) = self.links.get_mut(&from) else {
            log::debug!("Candidate from {from} without a link dropped");
            return;
        };
        if let Err(e) = link.apply_candidate(candidate) {
            log::warn!("{e}");
        }
    }

    fn on_caret_board(&mut self, board: &BTreeMap<ParticipantId, CaretReport>) {
        for timer in self.carets.apply_board(board) {
            self.effects.push_back(Effect::Timer(timer));
        }
        self.render_carets();
    }

    // ── transport ──────────────────────────────────────────────────

    fn on_transport(&mut self, peer: ParticipantId, conn: u64, event: TransportEvent) {
        let Some(link) = self.links.get_mut(&peer) else {
            log::debug!("Transport event for {peer} without a link dropped");
            return;
        };
        if link.conn() != conn {
            log::debug!("Event from replaced connection {conn} to {peer} dropped");
            return;
        }
        let inbound = link.on_transport_event(event);
        let closed = link.state() == LinkState::Closed;

        if let Some(payload) = inbound {
            match Edit::from_json(&payload) {
                Ok(edit) => {
                    self.on_remote_operation(peer, &edit);
                }
                Err(e) => log::warn!("Bad edit from {peer}: {e}"),
            }
        }
        if closed {
            self.links.remove(&peer);
        }
    }

    // ── local ──────────────────────────────────────────────────────

    fn on_keystroke(&mut self, key: Keystroke) {
        let input = match key {
            Keystroke::Char { cursor, ch } => Some(self.document.type_char(cursor, ch)),
            Keystroke::Append { ch } => {
                let end = self.document.text().chars().count();
                Some(self.document.type_char(end, ch))
            }
            Keystroke::Backspace { cursor } => self.document.backspace(cursor),
        };
        if let Some(input) = input {
            self.render_document();
            self.on_local_input(input);
        }
    }

    /// Replicate an applied local change, then sample the caret once.
    fn on_local_input(&mut self, input: InputEvent) {
        self.submit_local_edit(Operation::from_input(&input));
        self.effects.push_back(Effect::Relay(ClientMessage::Caret {
            position: input.cursor,
        }));
    }

    // ── output ─────────────────────────────────────────────────────

    fn flush_signals(&mut self) {
        for (remote, link) in self.links.iter_mut() {
            for signal in link.drain_outbound() {
                self.effects
                    .push_back(Effect::Relay(signal.into_message(*remote)));
            }
        }
    }

    fn render_document(&mut self) {
        let text = self.document.text().to_owned();
        self.effects
            .push_back(Effect::Render(RenderUpdate::Document(text)));
    }

    fn render_presence(&mut self) {
        self.effects
            .push_back(Effect::Render(RenderUpdate::Presence(self.presence.list())));
        self.render_carets();
    }

    fn render_carets(&mut self) {
        let overlays = self.carets.overlays(&self.presence);
        self.effects
            .push_back(Effect::Render(RenderUpdate::Carets(overlays)));
    }
}
