//! In-process multi-participant tests.
//!
//! A harness routes frames between sessions through a `RoomState` and lets
//! the in-memory network carry the data channels, pumping everything until
//! no frame or transport event is left in flight.

use std::collections::{BTreeMap, VecDeque};

use inkwell_collab::transport::{MemoryEndpoint, PeerEvent};
use inkwell_collab::{
    DocumentSurface, Effect, Keystroke, LinkState, MemoryNetwork, ParticipantId, ReplicationMode,
    Role, RoomState, ServerMessage, Session, SessionConfig, SessionEvent, TextBuffer,
    DEFAULT_ROOM,
};
use tokio::sync::mpsc::UnboundedReceiver;

struct Participant {
    session: Session<MemoryEndpoint, TextBuffer>,
    peer_rx: UnboundedReceiver<PeerEvent>,
    relay_frames_seen: usize,
}

struct Harness {
    mode: ReplicationMode,
    room: RoomState,
    net: MemoryNetwork,
    members: BTreeMap<ParticipantId, Participant>,
    inbox: VecDeque<(ParticipantId, ServerMessage)>,
    clock: u64,
}

impl Harness {
    fn new(mode: ReplicationMode) -> Self {
        Self {
            mode,
            room: RoomState::new(DEFAULT_ROOM, 100, true),
            net: MemoryNetwork::new(),
            members: BTreeMap::new(),
            inbox: VecDeque::new(),
            clock: 0,
        }
    }

    fn join(&mut self, name: &str) -> ParticipantId {
        let id = ParticipantId::new();
        let (factory, peer_rx) = self.net.endpoint(id);
        let config = SessionConfig {
            mode: self.mode,
            username: name.to_string(),
            ..SessionConfig::default()
        };
        let session = Session::new(id, config, factory, TextBuffer::default());
        self.members.insert(
            id,
            Participant {
                session,
                peer_rx,
                relay_frames_seen: 0,
            },
        );

        let deliveries = self.room.join(id, name).unwrap();
        self.route(deliveries);
        self.settle();
        id
    }

    fn leave(&mut self, id: ParticipantId) {
        // Dropping the session drops its transports, which closes them.
        self.members.remove(&id);
        let deliveries = self.room.leave(&id);
        self.route(deliveries);
        self.settle();
    }

    fn route(&mut self, deliveries: Vec<inkwell_collab::Delivery>) {
        for delivery in deliveries {
            for id in self.members.keys() {
                if delivery.audience.includes(id) {
                    self.inbox.push_back((*id, delivery.message.clone()));
                }
            }
        }
    }

    fn handle(&mut self, id: ParticipantId, event: SessionEvent) {
        if let Some(p) = self.members.get_mut(&id) {
            p.session.handle(event);
        }
        self.settle();
    }

    fn type_text(&mut self, id: ParticipantId, text: &str) {
        for ch in text.chars() {
            let cursor = self.text(id).chars().count();
            self.handle(id, SessionEvent::LocalKeystroke(Keystroke::Char { cursor, ch }));
        }
    }

    /// Pump frames, transport events and effects until quiet.
    fn settle(&mut self) {
        loop {
            let mut progressed = false;

            while let Some((to, msg)) = self.inbox.pop_front() {
                if let Some(p) = self.members.get_mut(&to) {
                    p.relay_frames_seen += 1;
                    p.session.handle(SessionEvent::Relay(msg));
                }
                progressed = true;
            }

            for p in self.members.values_mut() {
                while let Ok(PeerEvent { peer, conn, event }) = p.peer_rx.try_recv() {
                    p.session.handle(SessionEvent::Transport { peer, conn, event });
                    progressed = true;
                }
            }

            let ids: Vec<ParticipantId> = self.members.keys().copied().collect();
            for id in ids {
                let effects = match self.members.get_mut(&id) {
                    Some(p) => p.session.take_effects(),
                    None => continue,
                };
                for effect in effects {
                    if let Effect::Relay(msg) = effect {
                        self.clock += 1;
                        let deliveries = self.room.handle(id, msg, self.clock);
                        self.route(deliveries);
                        progressed = true;
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn session(&self, id: ParticipantId) -> &Session<MemoryEndpoint, TextBuffer> {
        &self.members[&id].session
    }

    fn text(&self, id: ParticipantId) -> String {
        self.session(id).document().text().to_string()
    }
}

#[test]
fn test_mesh_forms_between_three_participants() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    let b = h.join("bob");
    let c = h.join("carol");

    for (me, others) in [(a, [b, c]), (b, [a, c]), (c, [a, b])] {
        let mut expected = others.to_vec();
        expected.sort();
        assert_eq!(h.session(me).connected_peers(), expected);
    }
    // Each link is two channel halves.
    assert_eq!(h.net.open_channels(), 6);
}

#[test]
fn test_offer_collision_resolved_by_id_order() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    // Joining triggers offers from both sides at once.
    let a = h.join("alice");
    let b = h.join("bob");

    let (small, large) = if a < b { (a, b) } else { (b, a) };
    assert_eq!(h.session(small).link_role(&large), Some(Role::Initiator));
    assert_eq!(h.session(large).link_role(&small), Some(Role::Responder));
    assert_eq!(h.session(small).link_state(&large), Some(LinkState::Connected));
    assert_eq!(h.session(large).link_state(&small), Some(LinkState::Connected));
}

#[test]
fn test_edit_replicates_over_data_channels() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    let b = h.join("bob");
    let c = h.join("carol");

    h.type_text(a, "hi");
    assert_eq!(h.text(a), "hi");
    assert_eq!(h.text(b), "hi");
    assert_eq!(h.text(c), "hi");

    h.handle(b, SessionEvent::LocalKeystroke(Keystroke::Backspace { cursor: 2 }));
    for id in [a, b, c] {
        assert_eq!(h.text(id), "h");
    }
}

#[test]
fn test_relayed_mode_uses_the_relay_only() {
    let mut h = Harness::new(ReplicationMode::Relayed);
    let a = h.join("alice");
    let b = h.join("bob");

    assert_eq!(h.session(a).link_count(), 0);
    assert_eq!(h.net.open_channels(), 0);

    h.type_text(a, "abc");
    // The relay echoes to the sender; the echo is not applied twice.
    assert_eq!(h.text(a), "abc");
    assert_eq!(h.text(b), "abc");
}

#[test]
fn test_repeated_roster_does_not_renegotiate() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    let b = h.join("bob");
    let roster = ServerMessage::RosterUpdated {
        peers: h.room.roster(),
    };

    h.handle(a, SessionEvent::Relay(roster.clone()));
    h.handle(a, SessionEvent::Relay(roster));
    assert_eq!(h.session(a).link_count(), 1);
    assert_eq!(h.session(a).link_state(&b), Some(LinkState::Connected));
    assert_eq!(h.net.open_channels(), 2);
}

#[test]
fn test_departure_tears_down_links() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    let b = h.join("bob");
    let c = h.join("carol");

    h.leave(b);
    assert_eq!(h.session(a).link_state(&b), None);
    assert_eq!(h.session(c).link_state(&b), None);
    assert!(!h.session(a).roster().contains(&b));

    h.type_text(c, "x");
    assert_eq!(h.text(a), "x");
}

#[test]
fn test_presence_lists_every_participant() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    let b = h.join("bob");

    let names: Vec<String> = h
        .session(a)
        .presence()
        .list()
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"alice".to_string()));
    assert!(names.contains(&"bob".to_string()));

    h.leave(b);
    assert_eq!(h.session(a).presence().len(), 1);
}

#[test]
fn test_caret_is_visible_to_others_not_self() {
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    let b = h.join("bob");

    h.handle(a, SessionEvent::LocalCaret { position: 0 });
    let caret = h.session(b).carets().get(&a).copied().unwrap();
    assert!(caret.visible);
    assert_eq!(caret.position, 0);
    assert!(h.session(a).carets().get(&a).is_none());

    let overlays = h.session(b).carets().overlays(h.session(b).presence());
    assert_eq!(overlays[0].color, h.room.presence()[&a].metas[0].color);
    assert!(h.members[&b].relay_frames_seen > 0);
}

#[test]
fn test_late_joiner_starts_from_empty_text() {
    // No state transfer: a newcomer only sees edits made after it joined.
    let mut h = Harness::new(ReplicationMode::Mesh);
    let a = h.join("alice");
    h.type_text(a, "old");
    let b = h.join("bob");
    assert_eq!(h.text(b), "");

    h.type_text(a, "!");
    assert_eq!(h.text(b), "!");
    assert_eq!(h.text(a), "old!");
}
