//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── RoomState (roster, presence, carets)
//!            ├── Room ("editor:…")┤
//! Client B ──┘                    └── BroadcastGroup
//!                                          │
//!                               ┌──────────┼───────────┐
//!                               ▼          ▼           ▼
//!                            Client A   Client B    Client C
//!                         (each task filters frames by audience)
//! ```
//!
//! One task per connection. The relay assigns the participant id, runs the
//! room state machine under the room lock and publishes the resulting
//! deliveries; it never interprets descriptions, candidates or edits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Frame, Room, RoomManager};
use crate::protocol::{ClientMessage, ParticipantId, ServerMessage};
use crate::room::DEFAULT_ROOM;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub max_participants_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Deliver relayed edits back to their sender too
    pub echo_text_updates: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            max_participants_per_room: 100,
            broadcast_capacity: 256,
            echo_text_updates: true,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Per-connection state.
struct Connection {
    addr: SocketAddr,
    participant: ParticipantId,
    room: Option<Arc<Room>>,
    frames: Option<broadcast::Receiver<Arc<Frame>>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_participants_per_room,
            config.echo_text_updates,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                Self::handle_connection(stream, addr, rooms, stats).await;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::error!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            addr,
            participant: ParticipantId::new(),
            room: None,
            frames: None,
        };

        if let Err(e) = Self::pump(&mut conn, &mut ws_sender, &mut ws_receiver, &rooms, &stats).await {
            log::error!("Connection error from {addr}: {e}");
        }

        // The participant leaves however the socket ended.
        if let Some(room) = conn.room.take() {
            room.group.remove_peer(&conn.participant).await;
            let name = {
                let mut state = room.state.lock().await;
                let deliveries = state.leave(&conn.participant);
                room.publish_all(&deliveries);
                state.name().to_owned()
            };
            drop(room);
            rooms.remove_if_empty(&name).await;
        }

        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.room_count().await;
        log::info!("Connection closed from {addr}");
    }

    async fn pump(
        conn: &mut Connection,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientMessage::decode(text.as_str()) {
                                Ok(ClientMessage::Join { room, username }) => {
                                    Self::join(conn, ws_sender, rooms, stats, room, username).await?;
                                }
                                Ok(msg) => {
                                    let Some(room) = conn.room.as_ref() else {
                                        log::debug!("Frame from {} before join dropped", conn.addr);
                                        continue;
                                    };
                                    let leaving = matches!(msg, ClientMessage::Leave);
                                    {
                                        let mut state = room.state.lock().await;
                                        let deliveries = state.handle(conn.participant, msg, now_ms());
                                        room.publish_all(&deliveries);
                                    }
                                    if leaving {
                                        return Ok(());
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {}: {e}", conn.addr);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => return Ok(()),

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => return Err(e.into()),

                        _ => {}
                    }
                }

                frame = async {
                    match conn.frames.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet: nothing to forward.
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if frame.audience.includes(&conn.participant) {
                                ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Participant {} lagged by {n} frames", conn.participant);
                            if let Some(room) = conn.room.as_ref() {
                                room.group.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn join(
        conn: &mut Connection,
        ws_sender: &mut WsSink,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        room_name: String,
        username: String,
    ) -> Result<(), BoxError> {
        if conn.room.is_some() {
            log::warn!("{} sent a second join", conn.participant);
            return Ok(());
        }
        let room_name = if room_name.is_empty() {
            DEFAULT_ROOM.to_string()
        } else {
            room_name
        };

        let room = rooms.get_or_create(&room_name).await;
        let joined = {
            // Subscribe and join under the room lock so the joiner's first
            // frame is its own acknowledgment.
            let mut state = room.state.lock().await;
            match state.join(conn.participant, &username) {
                Ok(deliveries) => {
                    let rx = room.group.add_peer(conn.participant, &username).await;
                    room.publish_all(&deliveries);
                    Ok(rx)
                }
                Err(e) => Err(e),
            }
        };

        match joined {
            Ok(rx) => {
                conn.frames = Some(rx);
                conn.room = Some(room);
                stats.write().await.active_rooms = rooms.room_count().await;
            }
            Err(e) => {
                log::warn!("Join of {username} to {room_name} rejected: {e}");
                drop(room);
                rooms.remove_if_empty(&room_name).await;
                let reply = ServerMessage::JoinRejected { reason: e.to_string() }.encode()?;
                ws_sender.send(Message::Text(reply.into())).await?;
            }
        }
        Ok(())
    }

    /// Snapshot of the server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
