//! Room fan-out with backpressure.
//!
//! Each room owns one tokio broadcast channel. A frame is encoded once,
//! wrapped in an `Arc`, and every connection task filters it by
//! [`Audience`] before writing it to its socket. Each subscriber buffers up
//! to `capacity` frames; a slower one lags and loses the oldest frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};

use crate::protocol::{ParticipantId, ProtocolError};
use crate::room::{Audience, Delivery, RoomState};

/// An encoded frame and who should receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub audience: Audience,
    pub text: String,
}

impl Frame {
    pub fn encode(delivery: &Delivery) -> Result<Self, ProtocolError> {
        Ok(Self {
            audience: delivery.audience,
            text: delivery.message.encode()?,
        })
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Fan-out channel for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    /// Subscribed participants and their display names
    peers: RwLock<HashMap<ParticipantId, String>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per subscriber before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a participant and subscribe it.
    pub async fn add_peer(&self, id: ParticipantId, name: &str) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(id, name.to_owned());
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, id: &ParticipantId) -> Option<String> {
        self.peers.write().await.remove(id)
    }

    /// Encode and send a delivery. Returns the number of subscribers.
    pub fn publish(&self, delivery: &Delivery) -> Result<usize, ProtocolError> {
        let frame = Frame::encode(delivery)?;
        Ok(self.publish_raw(Arc::new(frame)))
    }

    /// Send a pre-encoded frame.
    pub fn publish_raw(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging subscriber lost.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, id: &ParticipantId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A room on the relay: its state plus its fan-out channel.
///
/// Deliveries are published while `state` is locked, so every subscriber
/// sees frames in the order the room produced them.
pub struct Room {
    pub state: Mutex<RoomState>,
    pub group: BroadcastGroup,
}

impl Room {
    pub fn new(name: &str, capacity: usize, limit: usize, echo_text_updates: bool) -> Self {
        Self {
            state: Mutex::new(RoomState::new(name, limit, echo_text_updates)),
            group: BroadcastGroup::new(capacity),
        }
    }

    /// Publish deliveries in order; encode failures are logged and skipped.
    pub fn publish_all(&self, deliveries: &[Delivery]) {
        for delivery in deliveries {
            if let Err(e) = self.group.publish(delivery) {
                log::error!("Failed to encode {}: {e}", delivery.message.event_name());
            }
        }
    }
}

/// Room name → room.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    capacity: usize,
    limit: usize,
    echo_text_updates: bool,
}

impl RoomManager {
    pub fn new(capacity: usize, limit: usize, echo_text_updates: bool) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            limit,
            echo_text_updates,
        }
    }

    /// Get or create the named room.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created it meanwhile.
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(Room::new(name, self.capacity, self.limit, self.echo_text_updates));
        rooms.insert(name.to_owned(), room.clone());
        log::debug!("Room {name} created");
        room
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Drop the named room if nobody is in it.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if room.group.peer_count().await == 0 {
                rooms.remove(name);
                log::info!("Room {name} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
