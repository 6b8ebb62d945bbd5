//! Roster reconciliation.
//!
//! Successive roster snapshots are diffed into `joined` / `left` sets that
//! drive peer link creation and teardown. The initial roster is diffed
//! against the empty set, so a newcomer initiates towards everyone already
//! present.

use std::collections::BTreeSet;

use crate::protocol::ParticipantId;

/// Result of comparing two roster snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub joined: BTreeSet<ParticipantId>,
    pub left: BTreeSet<ParticipantId>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// `joined = new − old`, `left = old − new`, never mentioning `local`.
pub fn diff_rosters(
    old: &BTreeSet<ParticipantId>,
    new: &BTreeSet<ParticipantId>,
    local: ParticipantId,
) -> RosterDiff {
    RosterDiff {
        joined: new.difference(old).filter(|id| **id != local).copied().collect(),
        left: old.difference(new).filter(|id| **id != local).copied().collect(),
    }
}

/// Holds the last roster snapshot seen by the local participant.
#[derive(Debug, Clone)]
pub struct MembershipReconciler {
    local: ParticipantId,
    roster: BTreeSet<ParticipantId>,
}

impl MembershipReconciler {
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            roster: BTreeSet::new(),
        }
    }

    /// Replace the stored roster with `snapshot` and return what changed.
    pub fn reconcile<I>(&mut self, snapshot: I) -> RosterDiff
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        let next: BTreeSet<ParticipantId> = snapshot.into_iter().collect();
        let diff = diff_rosters(&self.roster, &next, self.local);
        self.roster = next;
        diff
    }

    pub fn roster(&self) -> &BTreeSet<ParticipantId> {
        &self.roster
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.roster.contains(id)
    }

    /// Remote participants in the current roster.
    pub fn remotes(&self) -> impl Iterator<Item = &ParticipantId> {
        self.roster.iter().filter(move |id| **id != self.local)
    }
}
