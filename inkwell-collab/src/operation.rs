//! Single-character edit operations and the document surface they act on.
//!
//! Wire shapes (JSON):
//! ```text
//! { "type": "insert", "id": 7, "position": 1, "char": "X" }
//! { "type": "delete", "id": 8, "position": 4 }
//! { "type": "delete", "position_start": 2, "position_end": 4 }
//! ```
//!
//! Positions are character offsets into the receiver's *current* buffer.
//! There is no version or causal metadata, so concurrent edits near the
//! same offset may leave replicas with different text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Splice `ch` at `position` (clamped to the buffer length).
    Insert { position: usize, ch: char },
    /// Remove the character at `position`.
    Delete { position: usize },
    /// Remove the half-open range `start..end`.
    DeleteRange { start: usize, end: usize },
}

impl Operation {
    /// Build the operation a local input event describes.
    ///
    /// An inserted character sits just before the cursor; a removal leaves
    /// the cursor on the offset of the removed character.
    pub fn from_input(event: &InputEvent) -> Self {
        match event.inserted {
            Some(ch) => Operation::Insert {
                position: event.cursor.saturating_sub(1),
                ch,
            },
            None => Operation::Delete { position: event.cursor },
        }
    }

    /// Apply to `text` in place. Returns whether the text changed.
    ///
    /// Out-of-range positions are clamped, never rejected.
    pub fn apply_to(&self, text: &mut String) -> bool {
        let len = text.chars().count();
        match *self {
            Operation::Insert { position, ch } => {
                let at = byte_offset(text, position.min(len));
                text.insert(at, ch);
                true
            }
            Operation::Delete { position } => {
                if position >= len {
                    return false;
                }
                let at = byte_offset(text, position);
                text.remove(at);
                true
            }
            Operation::DeleteRange { start, end } => {
                let (start, end) = (start.min(len), end.min(len));
                if start >= end {
                    return false;
                }
                let from = byte_offset(text, start);
                let to = byte_offset(text, end);
                text.replace_range(from..to, "");
                true
            }
        }
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| i)
}

/// An operation plus the sender-local id used for dedup and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct Edit {
    pub id: Option<u64>,
    pub op: Operation,
}

impl Edit {
    pub fn new(id: u64, op: Operation) -> Self {
        Self { id: Some(id), op }
    }

    /// Edit without an id (never deduplicated).
    pub fn anonymous(op: Operation) -> Self {
        Self { id: None, op }
    }

    /// Encode for a peer data channel.
    pub fn to_json(&self) -> Result<String, OperationError> {
        serde_json::to_string(self).map_err(|e| OperationError::Malformed(e.to_string()))
    }

    /// Decode a peer data channel payload.
    pub fn from_json(payload: &str) -> Result<Self, OperationError> {
        serde_json::from_str(payload).map_err(|e| OperationError::Malformed(e.to_string()))
    }
}

impl From<Operation> for Edit {
    fn from(op: Operation) -> Self {
        Self::anonymous(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireKind {
    Insert,
    Delete,
}

/// Flat record matching the JSON shapes in the module docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireOperation {
    #[serde(rename = "type")]
    kind: WireKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
    #[serde(rename = "char", default, skip_serializing_if = "Option::is_none")]
    character: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position_end: Option<usize>,
}

impl TryFrom<WireOperation> for Edit {
    type Error = OperationError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        let op = match wire.kind {
            WireKind::Insert => {
                let position = wire.position.ok_or(OperationError::MissingField("position"))?;
                let text = wire.character.ok_or(OperationError::MissingField("char"))?;
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => Operation::Insert { position, ch },
                    _ => return Err(OperationError::NotOneCharacter(text)),
                }
            }
            WireKind::Delete => match (wire.position_start, wire.position_end, wire.position) {
                (Some(start), Some(end), _) => Operation::DeleteRange { start, end },
                (_, _, Some(position)) => Operation::Delete { position },
                _ => return Err(OperationError::MissingField("position")),
            },
        };
        Ok(Edit { id: wire.id, op })
    }
}

impl From<Edit> for WireOperation {
    fn from(edit: Edit) -> Self {
        let mut wire = WireOperation {
            kind: WireKind::Delete,
            id: edit.id,
            position: None,
            character: None,
            position_start: None,
            position_end: None,
        };
        match edit.op {
            Operation::Insert { position, ch } => {
                wire.kind = WireKind::Insert;
                wire.position = Some(position);
                wire.character = Some(ch.to_string());
            }
            Operation::Delete { position } => wire.position = Some(position),
            Operation::DeleteRange { start, end } => {
                wire.position_start = Some(start);
                wire.position_end = Some(end);
            }
        }
        wire
    }
}

/// Malformed operation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("`char` must be exactly one character, got {0:?}")]
    NotOneCharacter(String),
    #[error("malformed operation: {0}")]
    Malformed(String),
}

/// Input event emitted by the document surface after it applied a local
/// change: the inserted character (or `None` for a removal) and the cursor
/// offset after the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub inserted: Option<char>,
    pub cursor: usize,
}

/// The text widget the session reads from and writes remote edits into.
pub trait DocumentSurface {
    /// Current text value.
    fn text(&self) -> &str;

    /// Replace the text value.
    fn set_text(&mut self, text: String);

    /// Apply an operation through the surface. Returns whether it changed.
    fn apply(&mut self, op: &Operation) -> bool {
        let mut text = self.text().to_owned();
        let changed = op.apply_to(&mut text);
        if changed {
            self.set_text(text);
        }
        changed
    }

    /// Type `ch` with the cursor at `cursor`, as a user would.
    fn type_char(&mut self, cursor: usize, ch: char) -> InputEvent {
        let len = self.text().chars().count();
        let at = cursor.min(len);
        self.apply(&Operation::Insert { position: at, ch });
        InputEvent { inserted: Some(ch), cursor: at + 1 }
    }

    /// Backspace with the cursor at `cursor`. `None` at the start of text.
    fn backspace(&mut self, cursor: usize) -> Option<InputEvent> {
        let len = self.text().chars().count();
        let at = cursor.min(len).checked_sub(1)?;
        self.apply(&Operation::Delete { position: at });
        Some(InputEvent { inserted: None, cursor: at })
    }
}

/// Plain in-memory text buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn len_chars(&self) -> usize {
        self.text.chars().count()
    }
}

impl DocumentSurface for TextBuffer {
    fn text(&self) -> &str {
        &self.text
    }

    fn set_text(&mut self, text: String) {
        self.text = text;
    }

    fn apply(&mut self, op: &Operation) -> bool {
        op.apply_to(&mut self.text)
    }
}
