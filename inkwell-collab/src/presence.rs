//! Presence: who is in the room, under what name and color.
//!
//! State arrives once as a full snapshot (`presence_state`) and then as
//! join/leave diffs (`presence_diff`). Each participant id maps to one meta
//! record per connection, so the same id may be present several times
//! (e.g. two tabs); rendering uses the first record.
//!
//! ```text
//! presence_state ──► PresenceTracker::sync_state()  (wholesale replace)
//! presence_diff  ──► PresenceTracker::sync_diff()   (append joins, drop leaves)
//!                          │
//!                          ▼
//!                 PresenceTracker::list() ──► rendering collaborator
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ParticipantId;

/// Metadata for one connection of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub name: String,
    /// CSS color, e.g. `#3b82f6`.
    pub color: String,
    /// Identifies the connection this record belongs to.
    pub conn_ref: String,
}

/// All connection records of one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub metas: Vec<PresenceMeta>,
}

/// Participant id → connection records.
pub type PresenceState = BTreeMap<ParticipantId, PresenceEntry>;

/// Incremental presence change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// One row of the rendered presence list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceView {
    pub id: ParticipantId,
    pub name: String,
    pub color: String,
}

/// Replace local state with a full snapshot.
pub fn sync_state(_local: &PresenceState, snapshot: &PresenceState) -> PresenceState {
    snapshot
        .iter()
        .filter(|(_, entry)| !entry.metas.is_empty())
        .map(|(id, entry)| (*id, entry.clone()))
        .collect()
}

/// Apply a join/leave diff to local state.
///
/// Joined records are appended after the ones already present (a record
/// whose `conn_ref` is already known replaces nothing and is skipped).
/// Left records are removed by `conn_ref`; an id with no records left is
/// dropped.
pub fn sync_diff(local: &PresenceState, diff: &PresenceDiff) -> PresenceState {
    let mut state = local.clone();

    for (id, joined) in &diff.joins {
        let entry = state.entry(*id).or_default();
        for meta in &joined.metas {
            if !entry.metas.iter().any(|m| m.conn_ref == meta.conn_ref) {
                entry.metas.push(meta.clone());
            }
        }
    }

    for (id, left) in &diff.leaves {
        let Some(entry) = state.get_mut(id) else { continue };
        entry
            .metas
            .retain(|m| !left.metas.iter().any(|l| l.conn_ref == m.conn_ref));
        if entry.metas.is_empty() {
            state.remove(id);
        }
    }

    state
}

/// Local presence state owned by the session.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    state: PresenceState,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_state(&mut self, snapshot: &PresenceState) {
        self.state = sync_state(&self.state, snapshot);
    }

    pub fn sync_diff(&mut self, diff: &PresenceDiff) {
        self.state = sync_diff(&self.state, diff);
    }

    /// Ordered rows for rendering, first record per id.
    pub fn list(&self) -> Vec<PresenceView> {
        self.state
            .iter()
            .filter_map(|(id, entry)| {
                entry.metas.first().map(|meta| PresenceView {
                    id: *id,
                    name: meta.name.clone(),
                    color: meta.color.clone(),
                })
            })
            .collect()
    }

    /// Rendering color of `id`, if present.
    pub fn color_of(&self, id: &ParticipantId) -> Option<&str> {
        self.state
            .get(id)
            .and_then(|entry| entry.metas.first())
            .map(|meta| meta.color.as_str())
    }

    /// Number of connections `id` is present with.
    pub fn connections(&self, id: &ParticipantId) -> usize {
        self.state.get(id).map_or(0, |entry| entry.metas.len())
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid CSS color for an id.
///
/// The hue comes from the id's bits; saturation and lightness are fixed so
/// every participant gets a readable caret color.
pub fn color_for(id: &ParticipantId) -> String {
    color_from_uuid(id.as_uuid())
}

fn color_from_uuid(id: Uuid) -> String {
    let hash = id.as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u128) -> ParticipantId {
        ParticipantId::from_uuid(Uuid::from_u128(n))
    }

    fn meta(name: &str, conn: &str) -> PresenceMeta {
        PresenceMeta {
            name: name.into(),
            color: "#ff0000".into(),
            conn_ref: conn.into(),
        }
    }

    fn entry(metas: Vec<PresenceMeta>) -> PresenceEntry {
        PresenceEntry { metas }
    }

    #[test]
    fn test_sync_state_replaces_wholesale() {
        let mut tracker = PresenceTracker::new();
        let mut first = PresenceState::new();
        first.insert(pid(1), entry(vec![meta("alice", "a1")]));
        tracker.sync_state(&first);

        let mut second = PresenceState::new();
        second.insert(pid(2), entry(vec![meta("bob", "b1")]));
        tracker.sync_state(&second);

        let names: Vec<_> = tracker.list().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["bob"]);
    }

    #[test]
    fn test_sync_diff_join_and_leave() {
        let mut tracker = PresenceTracker::new();
        let mut joins = PresenceState::new();
        joins.insert(pid(1), entry(vec![meta("alice", "a1")]));
        joins.insert(pid(2), entry(vec![meta("bob", "b1")]));
        tracker.sync_diff(&PresenceDiff { joins, leaves: PresenceState::new() });
        assert_eq!(tracker.len(), 2);

        let mut leaves = PresenceState::new();
        leaves.insert(pid(1), entry(vec![meta("alice", "a1")]));
        tracker.sync_diff(&PresenceDiff { joins: PresenceState::new(), leaves });

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.list()[0].id, pid(2));
    }

    #[test]
    fn test_multiple_connections_per_participant() {
        let mut tracker = PresenceTracker::new();
        let mut joins = PresenceState::new();
        joins.insert(pid(1), entry(vec![meta("alice", "tab-1")]));
        tracker.sync_diff(&PresenceDiff { joins: joins.clone(), leaves: PresenceState::new() });

        let mut second_tab = PresenceState::new();
        second_tab.insert(pid(1), entry(vec![meta("alice (2)", "tab-2")]));
        tracker.sync_diff(&PresenceDiff { joins: second_tab, leaves: PresenceState::new() });
        assert_eq!(tracker.connections(&pid(1)), 2);
        // First record wins for rendering.
        assert_eq!(tracker.list()[0].name, "alice");

        // Closing the first tab keeps the participant present.
        tracker.sync_diff(&PresenceDiff { joins: PresenceState::new(), leaves: joins });
        assert_eq!(tracker.connections(&pid(1)), 1);
        assert_eq!(tracker.list()[0].name, "alice (2)");
    }

    #[test]
    fn test_duplicate_join_is_idempotent() {
        let mut tracker = PresenceTracker::new();
        let mut joins = PresenceState::new();
        joins.insert(pid(1), entry(vec![meta("alice", "a1")]));
        let diff = PresenceDiff { joins, leaves: PresenceState::new() };
        tracker.sync_diff(&diff);
        tracker.sync_diff(&diff);
        assert_eq!(tracker.connections(&pid(1)), 1);
    }

    #[test]
    fn test_leave_for_unknown_id_ignored() {
        let mut tracker = PresenceTracker::new();
        let mut leaves = PresenceState::new();
        leaves.insert(pid(9), entry(vec![meta("ghost", "g")]));
        tracker.sync_diff(&PresenceDiff { joins: PresenceState::new(), leaves });
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_list_ordered_by_id() {
        let mut snapshot = PresenceState::new();
        snapshot.insert(pid(3), entry(vec![meta("c", "3")]));
        snapshot.insert(pid(1), entry(vec![meta("a", "1")]));
        let mut tracker = PresenceTracker::new();
        tracker.sync_state(&snapshot);
        let ids: Vec<_> = tracker.list().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![pid(1), pid(3)]);
        assert_eq!(tracker.color_of(&pid(1)), Some("#ff0000"));
        assert_eq!(tracker.color_of(&pid(2)), None);
    }

    #[test]
    fn test_color_is_stable_css_hex() {
        let id = pid(0x550e8400_e29b_41d4_a716_446655440000);
        let color = color_for(&id);
        assert_eq!(color, color_for(&id));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_primary_hues() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5 && g.abs() < 1e-5 && b.abs() < 1e-5);
        let (r, g, b) = hsl_to_rgb(0.5, 0.0, 0.4);
        assert_eq!((r, g, b), (0.4, 0.4, 0.4));
    }
}
