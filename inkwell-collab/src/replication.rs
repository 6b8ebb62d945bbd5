//! Best-effort edit replication.
//!
//! Local edits are stamped with a per-sender id and handed to the session
//! for fan-out; the document surface has already applied them, so they are
//! never re-applied here. Remote edits are applied unconditionally at their
//! raw offsets. Echoes of our own edits and redelivered `(sender, id)` pairs
//! are dropped.
//!
//! There is no cross-sender ordering and no merge: two replicas that see
//! concurrent inserts at the same offset in different orders end up with
//! different text.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::operation::{DocumentSurface, Edit, Operation};
use crate::protocol::ParticipantId;

/// How edits reach other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Over every connected peer link's data channel.
    #[default]
    Mesh,
    /// Over the relay channel, tagged with the sender id.
    Relayed,
}

/// Outcome of a remote edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The document changed.
    Changed,
    /// Applied, but the clamped operation was a no-op.
    Unchanged,
    /// Our own edit looped back.
    Echo,
    /// Already applied from this sender.
    Duplicate,
}

/// Bounded set of recently seen ids for one sender.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl RecentIds {
    /// Record `id`; false if it was already present.
    fn insert(&mut self, id: u64, window: usize) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > window {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Stamps local edits and applies remote ones.
#[derive(Debug)]
pub struct ReplicationEngine {
    local: ParticipantId,
    next_id: u64,
    dedup_window: usize,
    recent: HashMap<ParticipantId, RecentIds>,
}

impl ReplicationEngine {
    pub fn new(local: ParticipantId, dedup_window: usize) -> Self {
        Self {
            local,
            next_id: 0,
            dedup_window: dedup_window.max(1),
            recent: HashMap::new(),
        }
    }

    /// Wrap a local operation with the next id.
    pub fn stamp(&mut self, op: Operation) -> Edit {
        self.next_id += 1;
        Edit::new(self.next_id, op)
    }

    /// Apply an edit received from `sender`.
    pub fn apply_remote<D: DocumentSurface>(
        &mut self,
        sender: ParticipantId,
        edit: &Edit,
        document: &mut D,
    ) -> Applied {
        if sender == self.local {
            log::debug!("Dropping echo of local edit {:?}", edit.id);
            return Applied::Echo;
        }
        if let Some(id) = edit.id {
            let window = self.dedup_window;
            if !self.recent.entry(sender).or_default().insert(id, window) {
                log::debug!("Dropping duplicate edit {id} from {sender}");
                return Applied::Duplicate;
            }
        }

        if document.apply(&edit.op) {
            log::trace!("Applied {:?} from {sender}", edit.op);
            Applied::Changed
        } else {
            log::debug!("Edit {:?} from {sender} was a no-op after clamping", edit.op);
            Applied::Unchanged
        }
    }

    /// Forget dedup state for a departed sender.
    pub fn forget(&mut self, sender: &ParticipantId) {
        self.recent.remove(sender);
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    /// Id of the most recently stamped edit.
    pub fn last_id(&self) -> u64 {
        self.next_id
    }
}
