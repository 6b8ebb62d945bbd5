//! WebSocket client for the relay channel.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect detection)
//! - Background reader/writer tasks
//! - Decoded [`ServerMessage`]s delivered as [`RelayEvent`]s

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ParticipantId, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Frame(ServerMessage),
    Disconnected,
}

/// Join acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// Participant id assigned by the relay
    pub id: ParticipantId,
    /// Roster at join time, including us
    pub peers: Vec<ParticipantId>,
}

impl Joined {
    /// The acknowledgment as the relay frame it came in.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Joined {
            socket_id: self.id,
            peers: self.peers.clone(),
        }
    }
}

/// Connection to a relay server.
pub struct RelayClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    event_tx: mpsc::Sender<RelayEvent>,
    join_timeout: Duration,
}

impl RelayClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            join_timeout: Duration::from_secs(5),
        }
    }

    /// How long [`join`](Self::join) waits for the acknowledgment.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Cannot reach relay {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(frame) => {
                            if event_tx.send(RelayEvent::Frame(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Bad frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Relay connection error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to relay {}", self.server_url);
        Ok(())
    }

    /// Join `room` and wait for the acknowledgment.
    ///
    /// Must be called before the event receiver is taken.
    pub async fn join(&mut self, room: &str, username: &str) -> Result<Joined, ProtocolError> {
        self.send(&ClientMessage::Join {
            room: room.to_owned(),
            username: username.to_owned(),
        })
        .await?;

        let events = self.event_rx.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        let wait = async {
            loop {
                match events.recv().await {
                    Some(RelayEvent::Frame(ServerMessage::Joined { socket_id, peers })) => {
                        return Ok(Joined { id: socket_id, peers });
                    }
                    Some(RelayEvent::Frame(ServerMessage::JoinRejected { reason })) => {
                        return Err(ProtocolError::JoinRejected(reason));
                    }
                    Some(RelayEvent::Frame(other)) => {
                        log::debug!("{} before join acknowledgment dropped", other.event_name());
                    }
                    Some(RelayEvent::Disconnected) | None => {
                        return Err(ProtocolError::ConnectionClosed);
                    }
                }
            }
        };

        match tokio::time::timeout(self.join_timeout, wait).await {
            Ok(result) => {
                if let Ok(joined) = &result {
                    log::info!("Joined {room} as {} ({} present)", joined.id, joined.peers.len());
                }
                result
            }
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Push a frame to the relay.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Sender half for pushing frames from another task.
    pub fn sender(&self) -> Option<RelaySender> {
        self.outgoing_tx.clone().map(|tx| RelaySender { tx })
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Cloneable handle that pushes frames to the relay.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<String>,
}

impl RelaySender {
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.tx
            .send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Forward frames from `rx` until either side closes.
    pub fn spawn_forwarder(self, mut rx: mpsc::Receiver<ClientMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = self.send(&msg).await {
                    log::warn!("Relay send failed: {e}");
                    break;
                }
            }
        })
    }
}
