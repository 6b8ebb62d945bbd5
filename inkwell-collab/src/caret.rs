//! Ephemeral remote carets with decay on inactivity.
//!
//! The relay broadcasts the whole caret board on every change. The tracker
//! replaces its map with each board; an entry whose `updated_at` moved gets
//! a fresh decay timer (a new generation), and a timer that fires for an
//! older generation is ignored. After [`CARET_DECAY`] without an update the
//! caret is hidden.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::presence::PresenceTracker;
use crate::protocol::ParticipantId;

/// Inactivity window before a caret fades out.
pub const CARET_DECAY: Duration = Duration::from_millis(2000);

/// Fallback color for carets of participants missing from presence.
const UNKNOWN_COLOR: &str = "#9ca3af";

/// One participant's entry on the relay's caret board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaretReport {
    pub position: usize,
    /// Relay timestamp of the last update (milliseconds, strictly increasing per room).
    pub updated_at: u64,
}

/// Locally tracked caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaretState {
    pub position: usize,
    pub updated_at: u64,
    pub visible: bool,
    generation: u64,
}

/// Caret overlay for the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaretOverlay {
    pub participant_id: ParticipantId,
    pub position: usize,
    pub color: String,
    pub visible: bool,
}

/// Timer instruction for the host's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayTimer {
    /// Cancel any timer for `participant` and start a new one.
    Restart {
        participant: ParticipantId,
        generation: u64,
        after: Duration,
    },
    Cancel { participant: ParticipantId },
}

/// Remote carets of the room.
#[derive(Debug)]
pub struct CaretTracker {
    local: ParticipantId,
    decay: Duration,
    carets: HashMap<ParticipantId, CaretState>,
    next_generation: u64,
}

impl CaretTracker {
    pub fn new(local: ParticipantId, decay: Duration) -> Self {
        Self {
            local,
            decay,
            carets: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Replace the tracked carets with a board from the relay.
    pub fn apply_board(&mut self, board: &BTreeMap<ParticipantId, CaretReport>) -> Vec<DecayTimer> {
        let mut timers = Vec::new();

        let gone: Vec<ParticipantId> = self
            .carets
            .keys()
            .filter(|id| !board.contains_key(*id))
            .copied()
            .collect();
        for participant in gone {
            self.carets.remove(&participant);
            timers.push(DecayTimer::Cancel { participant });
        }

        for (participant, report) in board {
            if *participant == self.local {
                continue;
            }
            let fresh = self
                .carets
                .get(participant)
                .map_or(true, |known| known.updated_at != report.updated_at);

            if fresh {
                self.next_generation += 1;
                let generation = self.next_generation;
                self.carets.insert(
                    *participant,
                    CaretState {
                        position: report.position,
                        updated_at: report.updated_at,
                        visible: true,
                        generation,
                    },
                );
                timers.push(DecayTimer::Restart {
                    participant: *participant,
                    generation,
                    after: self.decay,
                });
                log::trace!("Caret of {participant} at {}", report.position);
            } else if let Some(known) = self.carets.get_mut(participant) {
                known.position = report.position;
            }
        }

        timers
    }

    /// A decay timer fired. Returns true if a caret was hidden.
    pub fn expire(&mut self, participant: &ParticipantId, generation: u64) -> bool {
        match self.carets.get_mut(participant) {
            Some(caret) if caret.generation == generation && caret.visible => {
                caret.visible = false;
                log::trace!("Caret of {participant} faded");
                true
            }
            _ => false,
        }
    }

    /// Drop a participant's caret.
    pub fn remove(&mut self, participant: &ParticipantId) -> Option<DecayTimer> {
        self.carets
            .remove(participant)
            .map(|_| DecayTimer::Cancel { participant: *participant })
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&CaretState> {
        self.carets.get(participant)
    }

    /// Overlays ordered by participant id, colored from presence.
    pub fn overlays(&self, presence: &PresenceTracker) -> Vec<CaretOverlay> {
        let mut overlays: Vec<CaretOverlay> = self
            .carets
            .iter()
            .map(|(id, caret)| CaretOverlay {
                participant_id: *id,
                position: caret.position,
                color: presence.color_of(id).unwrap_or(UNKNOWN_COLOR).to_owned(),
                visible: caret.visible,
            })
            .collect();
        overlays.sort_by_key(|o| o.participant_id);
        overlays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pid(n: u128) -> ParticipantId {
        ParticipantId::from_uuid(Uuid::from_u128(n))
    }

    fn board(entries: &[(u128, usize, u64)]) -> BTreeMap<ParticipantId, CaretReport> {
        entries
            .iter()
            .map(|(id, position, updated_at)| {
                (pid(*id), CaretReport { position: *position, updated_at: *updated_at })
            })
            .collect()
    }

    fn restart_generation(timers: &[DecayTimer], who: ParticipantId) -> u64 {
        timers
            .iter()
            .find_map(|t| match t {
                DecayTimer::Restart { participant, generation, .. } if *participant == who => {
                    Some(*generation)
                }
                _ => None,
            })
            .expect("restart timer")
    }

    #[test]
    fn test_new_caret_visible_with_timer() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        let timers = tracker.apply_board(&board(&[(2, 5, 100)]));

        assert_eq!(timers.len(), 1);
        assert!(matches!(
            timers[0],
            DecayTimer::Restart { after, .. } if after == Duration::from_millis(2000)
        ));
        let caret = tracker.get(&pid(2)).unwrap();
        assert!(caret.visible);
        assert_eq!(caret.position, 5);
    }

    #[test]
    fn test_own_caret_ignored() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        assert!(tracker.apply_board(&board(&[(1, 5, 100)])).is_empty());
        assert!(tracker.get(&pid(1)).is_none());
    }

    #[test]
    fn test_expiry_hides_caret() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        let timers = tracker.apply_board(&board(&[(2, 5, 100)]));
        let generation = restart_generation(&timers, pid(2));

        assert!(tracker.expire(&pid(2), generation));
        assert!(!tracker.get(&pid(2)).unwrap().visible);
        assert!(!tracker.expire(&pid(2), generation));
    }

    #[test]
    fn test_update_before_deadline_supersedes_old_timer() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        let first = restart_generation(&tracker.apply_board(&board(&[(2, 5, 100)])), pid(2));
        let second = restart_generation(&tracker.apply_board(&board(&[(2, 6, 200)])), pid(2));
        assert_ne!(first, second);

        // The superseded timer fires late: ignored.
        assert!(!tracker.expire(&pid(2), first));
        let caret = tracker.get(&pid(2)).unwrap();
        assert!(caret.visible);
        assert_eq!(caret.position, 6);
    }

    #[test]
    fn test_unchanged_entry_keeps_its_timer() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        let first = tracker.apply_board(&board(&[(2, 5, 100)]));
        let generation = restart_generation(&first, pid(2));

        // Someone else moved; participant 2's entry is unchanged.
        let timers = tracker.apply_board(&board(&[(2, 5, 100), (3, 1, 150)]));
        assert_eq!(timers.len(), 1);
        assert_eq!(restart_generation(&timers, pid(3)), generation + 1);
        assert!(tracker.expire(&pid(2), generation));
    }

    #[test]
    fn test_missing_from_board_is_removed() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        tracker.apply_board(&board(&[(2, 5, 100), (3, 1, 100)]));
        let timers = tracker.apply_board(&board(&[(3, 1, 100)]));
        assert_eq!(timers, vec![DecayTimer::Cancel { participant: pid(2) }]);
        assert!(tracker.get(&pid(2)).is_none());
    }

    #[test]
    fn test_overlays_use_presence_color() {
        let mut tracker = CaretTracker::new(pid(1), CARET_DECAY);
        tracker.apply_board(&board(&[(2, 5, 100)]));
        let overlays = tracker.overlays(&PresenceTracker::new());
        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].color, UNKNOWN_COLOR);
        assert!(overlays[0].visible);
    }
}
