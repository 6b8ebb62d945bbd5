//! In-process transport used by tests and local demos.
//!
//! Every [`MemoryTransport`] is one connection slot. Descriptions and
//! candidates name the slot they came from (`conn=<n>`), which is how the
//! two halves of a connection find each other. A channel opens once both
//! halves hold a local and a remote description and have each heard a
//! candidate from the other side; then `ChannelOpen` is delivered to both
//! owners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{PeerEvent, PeerTransport, TransportError, TransportEvent, TransportFactory};
use crate::protocol::{IceCandidate, ParticipantId, SdpKind, SessionDescription};

#[derive(Debug, Default)]
struct Slot {
    owner: ParticipantId,
    remote: ParticipantId,
    paired: Option<u64>,
    has_local: bool,
    has_remote: bool,
    heard_candidate: bool,
    open: bool,
}

#[derive(Default)]
struct Inner {
    next_conn: u64,
    slots: HashMap<u64, Slot>,
    sinks: HashMap<ParticipantId, mpsc::UnboundedSender<PeerEvent>>,
}

impl Inner {
    /// Deliver `event` of slot `conn` to its owner.
    fn emit(&self, conn: u64, event: TransportEvent) {
        let Some(slot) = self.slots.get(&conn) else { return };
        if let Some(sink) = self.sinks.get(&slot.owner) {
            let _ = sink.send(PeerEvent {
                peer: slot.remote,
                conn,
                event,
            });
        }
    }

    fn try_open(&mut self, conn: u64) {
        let Some(a) = self.slots.get(&conn) else { return };
        let Some(other) = a.paired else { return };
        let Some(b) = self.slots.get(&other) else { return };

        let ready = |s: &Slot| s.has_local && s.has_remote && s.heard_candidate;
        if a.open || b.paired != Some(conn) || !ready(a) || !ready(b) {
            return;
        }

        for id in [conn, other] {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.open = true;
            }
            self.emit(id, TransportEvent::ChannelOpen);
        }
    }
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `local` and get its transport factory plus event stream.
    pub fn endpoint(
        &self,
        local: ParticipantId,
    ) -> (MemoryEndpoint, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().sinks.insert(local, tx);
        let endpoint = MemoryEndpoint {
            network: self.clone(),
            local,
        };
        (endpoint, rx)
    }

    /// Number of connection halves with an open channel.
    pub fn open_channels(&self) -> usize {
        self.lock().slots.values().filter(|s| s.open).count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-participant transport factory.
pub struct MemoryEndpoint {
    network: MemoryNetwork,
    local: ParticipantId,
}

impl MemoryEndpoint {
    pub fn local(&self) -> ParticipantId {
        self.local
    }
}

impl TransportFactory for MemoryEndpoint {
    type Transport = MemoryTransport;

    fn open(&mut self, remote: ParticipantId) -> Result<MemoryTransport, TransportError> {
        let mut inner = self.network.lock();
        inner.next_conn += 1;
        let conn = inner.next_conn;
        inner.slots.insert(
            conn,
            Slot {
                owner: self.local,
                remote,
                ..Slot::default()
            },
        );
        Ok(MemoryTransport {
            network: self.network.clone(),
            conn,
        })
    }
}

/// One half of an in-process connection.
pub struct MemoryTransport {
    network: MemoryNetwork,
    conn: u64,
}

fn conn_ref(text: &str) -> Option<u64> {
    text.split_whitespace()
        .find_map(|token| token.strip_prefix("conn="))
        .and_then(|n| n.parse().ok())
}

impl PeerTransport for MemoryTransport {
    fn conn_id(&self) -> u64 {
        self.conn
    }

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let inner = self.network.lock();
        let slot = inner.slots.get(&self.conn).ok_or(TransportError::Closed)?;
        Ok(SessionDescription::offer(format!(
            "memory conn={} owner={}",
            self.conn, slot.owner
        )))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let inner = self.network.lock();
        let slot = inner.slots.get(&self.conn).ok_or(TransportError::Closed)?;
        if !slot.has_remote {
            return Err(TransportError::Negotiation("no remote offer applied".into()));
        }
        Ok(SessionDescription::answer(format!(
            "memory conn={} owner={}",
            self.conn, slot.owner
        )))
    }

    fn set_local_description(&mut self, _desc: &SessionDescription) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        let slot = inner.slots.get_mut(&self.conn).ok_or(TransportError::Closed)?;
        slot.has_local = true;

        let candidate = IceCandidate::new(format!("candidate:memory conn={}", self.conn));
        inner.emit(self.conn, TransportEvent::LocalCandidate(candidate));
        Ok(())
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), TransportError> {
        let other = conn_ref(&desc.sdp)
            .ok_or_else(|| TransportError::Negotiation(format!("malformed sdp: {}", desc.sdp)))?;

        let mut inner = self.network.lock();
        let slot = inner.slots.get(&self.conn).ok_or(TransportError::Closed)?;
        let remote = slot.remote;
        if desc.kind == SdpKind::Answer && !slot.has_local {
            return Err(TransportError::Negotiation("answer without local offer".into()));
        }
        match inner.slots.get(&other) {
            Some(peer) if peer.owner == remote => {}
            _ => {
                return Err(TransportError::Negotiation(format!(
                    "description does not come from {remote}"
                )))
            }
        }

        if let Some(slot) = inner.slots.get_mut(&self.conn) {
            slot.paired = Some(other);
            slot.has_remote = true;
        }
        inner.try_open(self.conn);
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        let slot = inner.slots.get_mut(&self.conn).ok_or(TransportError::Closed)?;
        let Some(paired) = slot.paired else {
            return Err(TransportError::Negotiation(
                "candidate before remote description".into(),
            ));
        };
        // Candidates from an abandoned connection attempt are ignored.
        if conn_ref(&candidate.candidate) == Some(paired) {
            slot.heard_candidate = true;
            inner.try_open(self.conn);
        }
        Ok(())
    }

    fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        let inner = self.network.lock();
        let slot = inner.slots.get(&self.conn).ok_or(TransportError::Closed)?;
        let Some(other) = slot.paired.filter(|_| slot.open) else {
            return Err(TransportError::ChannelNotOpen);
        };
        inner.emit(other, TransportEvent::Message(payload.to_owned()));
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = self.network.lock();
        let Some(slot) = inner.slots.remove(&self.conn) else { return };
        let Some(other) = slot.paired else { return };

        let notify = match inner.slots.get_mut(&other) {
            Some(peer) if peer.paired == Some(self.conn) => {
                peer.open = false;
                peer.paired = None;
                true
            }
            _ => false,
        };
        if notify {
            inner.emit(other, TransportEvent::Closed);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
