//! Async host for a [`Session`].
//!
//! The runner owns the session inside one task and feeds it relay frames,
//! transport events, local commands and fired caret timers, one at a time.
//! Effects go back out over channels: frames to the relay, render updates to
//! the rendering collaborator, timer instructions to [`DecayTimers`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::caret::DecayTimer;
use crate::client::RelayEvent;
use crate::operation::{DocumentSurface, InputEvent};
use crate::protocol::{ClientMessage, ParticipantId};
use crate::session::{Effect, Keystroke, RenderUpdate, Session, SessionEvent};
use crate::transport::{PeerEvent, TransportFactory};

/// Commands from the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    Input(InputEvent),
    Keystroke(Keystroke),
    Caret(usize),
    Shutdown,
}

/// Handle for submitting local commands to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<LocalCommand>,
}

impl SessionHandle {
    /// Returns false once the runner has stopped.
    pub fn send(&self, cmd: LocalCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    pub fn type_char(&self, cursor: usize, ch: char) -> bool {
        self.send(LocalCommand::Keystroke(Keystroke::Char { cursor, ch }))
    }

    /// Type `ch` at whatever the end of the text is when the runner gets it.
    pub fn append(&self, ch: char) -> bool {
        self.send(LocalCommand::Keystroke(Keystroke::Append { ch }))
    }

    pub fn backspace(&self, cursor: usize) -> bool {
        self.send(LocalCommand::Keystroke(Keystroke::Backspace { cursor }))
    }

    pub fn caret(&self, position: usize) -> bool {
        self.send(LocalCommand::Caret(position))
    }

    pub fn shutdown(&self) -> bool {
        self.send(LocalCommand::Shutdown)
    }
}

/// One sleeping task per remote caret.
pub struct DecayTimers {
    tasks: HashMap<ParticipantId, JoinHandle<()>>,
    fired_tx: mpsc::UnboundedSender<(ParticipantId, u64)>,
}

impl DecayTimers {
    pub fn new(fired_tx: mpsc::UnboundedSender<(ParticipantId, u64)>) -> Self {
        Self {
            tasks: HashMap::new(),
            fired_tx,
        }
    }

    /// Abort any timer for `participant` and start a new one.
    pub fn restart(&mut self, participant: ParticipantId, generation: u64, after: Duration) {
        self.cancel(&participant);
        let tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((participant, generation));
        });
        self.tasks.insert(participant, handle);
    }

    pub fn cancel(&mut self, participant: &ParticipantId) {
        if let Some(handle) = self.tasks.remove(participant) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    pub fn apply(&mut self, timer: DecayTimer) {
        match timer {
            DecayTimer::Restart { participant, generation, after } => {
                self.restart(participant, generation, after)
            }
            DecayTimer::Cancel { participant } => self.cancel(&participant),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for DecayTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Drives a session until shutdown or relay disconnect.
pub struct SessionRunner<F: TransportFactory, D> {
    session: Session<F, D>,
    relay_rx: mpsc::Receiver<RelayEvent>,
    relay_tx: mpsc::Sender<ClientMessage>,
    render_tx: mpsc::UnboundedSender<RenderUpdate>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    local_rx: mpsc::UnboundedReceiver<LocalCommand>,
    fired_rx: mpsc::UnboundedReceiver<(ParticipantId, u64)>,
    timers: DecayTimers,
}

impl<F: TransportFactory, D: DocumentSurface> SessionRunner<F, D> {
    pub fn new(
        session: Session<F, D>,
        relay_rx: mpsc::Receiver<RelayEvent>,
        relay_tx: mpsc::Sender<ClientMessage>,
        render_tx: mpsc::UnboundedSender<RenderUpdate>,
    ) -> (Self, SessionHandle) {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let runner = Self {
            session,
            relay_rx,
            relay_tx,
            render_tx,
            peer_rx: None,
            local_rx,
            fired_rx,
            timers: DecayTimers::new(fired_tx),
        };
        (runner, SessionHandle { tx: local_tx })
    }

    /// Events from the peer transport (mesh mode).
    pub fn with_peer_events(mut self, peer_rx: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        self.peer_rx = Some(peer_rx);
        self
    }

    /// Run until shutdown or relay disconnect; returns the session.
    pub async fn run(mut self) -> Session<F, D> {
        log::info!("Session {} running", self.session.local_id());
        loop {
            let event = tokio::select! {
                Some(cmd) = self.local_rx.recv() => match cmd {
                    LocalCommand::Input(input) => SessionEvent::LocalInput(input),
                    LocalCommand::Keystroke(key) => SessionEvent::LocalKeystroke(key),
                    LocalCommand::Caret(position) => SessionEvent::LocalCaret { position },
                    LocalCommand::Shutdown => {
                        self.session.shutdown();
                        self.flush().await;
                        break;
                    }
                },
                relay = self.relay_rx.recv() => match relay {
                    Some(RelayEvent::Frame(msg)) => SessionEvent::Relay(msg),
                    Some(RelayEvent::Disconnected) | None => {
                        log::info!("Relay gone, session {} stopping", self.session.local_id());
                        break;
                    }
                },
                Some(PeerEvent { peer, conn, event }) = next_peer_event(&mut self.peer_rx) => {
                    SessionEvent::Transport { peer, conn, event }
                }
                Some((participant, generation)) = self.fired_rx.recv() => {
                    SessionEvent::CaretExpired { participant, generation }
                }
            };
            self.session.handle(event);
            self.flush().await;
        }

        self.timers.cancel_all();
        self.session
    }

    async fn flush(&mut self) {
        for effect in self.session.take_effects() {
            match effect {
                Effect::Relay(msg) => {
                    if self.relay_tx.send(msg).await.is_err() {
                        log::warn!("Relay outbound channel closed");
                    }
                }
                Effect::Render(update) => {
                    let _ = self.render_tx.send(update);
                }
                Effect::Timer(timer) => self.timers.apply(timer),
            }
        }
    }
}

async fn next_peer_event(rx: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::caret::CaretReport;
    use crate::operation::TextBuffer;
    use crate::protocol::ServerMessage;
    use crate::replication::ReplicationMode;
    use crate::session::SessionConfig;
    use crate::transport::Unavailable;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn pid(n: u128) -> ParticipantId {
        ParticipantId::from_uuid(Uuid::from_u128(n))
    }

    struct Harness {
        relay_in: mpsc::Sender<RelayEvent>,
        relay_out: mpsc::Receiver<ClientMessage>,
        renders: mpsc::UnboundedReceiver<RenderUpdate>,
        handle: SessionHandle,
        task: JoinHandle<Session<Unavailable, TextBuffer>>,
    }

    fn start(text: &str) -> Harness {
        let config = SessionConfig {
            mode: ReplicationMode::Relayed,
            ..SessionConfig::default()
        };
        let session = Session::new(pid(1), config, Unavailable, TextBuffer::new(text));
        let (relay_in, relay_rx) = mpsc::channel(16);
        let (relay_tx, relay_out) = mpsc::channel(16);
        let (render_tx, renders) = mpsc::unbounded_channel();
        let (runner, handle) = SessionRunner::new(session, relay_rx, relay_tx, render_tx);
        Harness {
            relay_in,
            relay_out,
            renders,
            handle,
            task: tokio::spawn(runner.run()),
        }
    }

    fn board(position: usize, updated_at: u64) -> RelayEvent {
        let mut carets = BTreeMap::new();
        carets.insert(pid(2), CaretReport { position, updated_at });
        RelayEvent::Frame(ServerMessage::CaretPositions { carets })
    }

    async fn next_carets(renders: &mut mpsc::UnboundedReceiver<RenderUpdate>) -> Vec<crate::caret::CaretOverlay> {
        loop {
            match renders.recv().await {
                Some(RenderUpdate::Carets(overlays)) => return overlays,
                Some(_) => continue,
                None => panic!("runner stopped"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caret_fades_after_decay() {
        let mut h = start("");
        let start = Instant::now();
        h.relay_in.send(board(3, 1)).await.unwrap();

        let shown = next_carets(&mut h.renders).await;
        assert!(shown[0].visible);

        let faded = next_carets(&mut h.renders).await;
        assert!(!faded[0].visible);
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caret_update_restarts_decay() {
        let mut h = start("");
        let start = Instant::now();
        h.relay_in.send(board(3, 1)).await.unwrap();
        next_carets(&mut h.renders).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.relay_in.send(board(4, 2)).await.unwrap();
        let moved = next_carets(&mut h.renders).await;
        assert!(moved[0].visible);
        assert_eq!(moved[0].position, 4);

        let faded = next_carets(&mut h.renders).await;
        assert!(!faded[0].visible);
        assert!(start.elapsed() >= Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn test_keystroke_reaches_relay_and_render() {
        let mut h = start("ab");
        assert!(h.handle.type_char(2, 'c'));

        match h.relay_out.recv().await {
            Some(ClientMessage::TextUpdated { op }) => assert_eq!(op.id, Some(1)),
            other => panic!("expected text update, got {other:?}"),
        }
        assert_eq!(
            h.renders.recv().await,
            Some(RenderUpdate::Document("abc".into()))
        );
        assert_eq!(h.relay_out.recv().await, Some(ClientMessage::Caret { position: 3 }));

        assert!(h.handle.append('d'));
        match h.relay_out.recv().await {
            Some(ClientMessage::TextUpdated { op }) => {
                assert_eq!(op.op, crate::operation::Operation::Insert { position: 3, ch: 'd' });
            }
            other => panic!("expected text update, got {other:?}"),
        }
        assert_eq!(h.relay_out.recv().await, Some(ClientMessage::Caret { position: 4 }));

        assert!(h.handle.shutdown());
        assert_eq!(h.relay_out.recv().await, Some(ClientMessage::Leave));
        let session = h.task.await.unwrap();
        assert_eq!(session.document().text(), "abcd");
    }

    #[tokio::test]
    async fn test_relay_disconnect_stops_runner() {
        let h = start("x");
        h.relay_in.send(RelayEvent::Disconnected).await.unwrap();
        let session = h.task.await.unwrap();
        assert_eq!(session.local_id(), pid(1));
    }

    #[tokio::test]
    async fn test_decay_timers_abort_on_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = DecayTimers::new(tx);
        timers.restart(pid(2), 1, Duration::from_millis(50));
        timers.restart(pid(2), 2, Duration::from_millis(10));
        assert_eq!(timers.len(), 1);
        assert_eq!(rx.recv().await, Some((pid(2), 2)));

        timers.restart(pid(3), 3, Duration::from_secs(60));
        timers.cancel(&pid(3));
        timers.cancel_all();
        assert!(timers.is_empty());
    }
}
