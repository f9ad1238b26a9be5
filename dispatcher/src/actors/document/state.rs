//! DocumentActor state types and sibling re-basing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use shared_types::{InsertionMode, Position, TextRange};

use crate::document::TextDocument;

/// How a session writes into its document.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub mode: InsertionMode,
    pub range: TextRange,
    /// Inserted once at the anchor when the session starts.
    pub pre_separator: Option<String>,
    /// Inserted once on finish, only if the session wrote something.
    pub post_separator: Option<String>,
}

/// A completed edit, expressed so sibling positions can be moved past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    /// Text inserted at `at`; `end` is the position right after it.
    Insert { at: Position, end: Position },
    Delete { range: TextRange },
}

impl Edit {
    /// Maps a pre-edit position to the equivalent post-edit position.
    pub fn transform(&self, pos: Position) -> Position {
        match *self {
            Edit::Insert { at, end } => {
                if pos < at {
                    pos
                } else if pos.line == at.line {
                    Position::new(end.line, end.column + (pos.column - at.column))
                } else {
                    Position::new(pos.line + (end.line - at.line), pos.column)
                }
            }
            Edit::Delete { range } => {
                let (start, end) = (range.start, range.end);
                if pos <= start {
                    pos
                } else if pos < end {
                    start
                } else if pos.line == end.line {
                    Position::new(start.line, start.column + (pos.column - end.column))
                } else {
                    Position::new(pos.line - range.line_span(), pos.column)
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: u64,
    pub mode: InsertionMode,
    /// Start of the range as registered; never re-based. Orders siblings.
    pub origin: Position,
    pub original_range: TextRange,
    pub anchor: Position,
    pub initial_anchor: Position,
    pub inserted_chars: usize,
    pub has_content: bool,
    pub started: bool,
    pub finished: bool,
    pub pre_separator: Option<String>,
    pub post_separator: Option<String>,
}

impl SessionState {
    pub fn new(session_id: u64, options: SessionOptions) -> Self {
        let range = options.range;
        let anchor = match options.mode {
            InsertionMode::Append => range.end,
            InsertionMode::Replace => range.start,
        };
        Self {
            session_id,
            mode: options.mode,
            origin: range.start,
            original_range: range,
            anchor,
            initial_anchor: anchor,
            inserted_chars: 0,
            has_content: false,
            started: false,
            finished: false,
            pre_separator: options.pre_separator.filter(|s| !s.is_empty()),
            post_separator: options.post_separator.filter(|s| !s.is_empty()),
        }
    }

    /// Ties on `origin` go to the session registered first.
    fn order_key(&self) -> (Position, u64) {
        (self.origin, self.session_id)
    }

    pub fn is_after(&self, other: &SessionState) -> bool {
        self.order_key() > other.order_key()
    }

    pub fn apply_edit(&mut self, edit: &Edit) {
        self.anchor = edit.transform(self.anchor);
        self.initial_anchor = edit.transform(self.initial_anchor);
        self.original_range = TextRange {
            start: edit.transform(self.original_range.start),
            end: edit.transform(self.original_range.end),
        };
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            mode: self.mode,
            original_range: self.original_range,
            anchor: self.anchor,
            initial_anchor: self.initial_anchor,
            inserted_chars: self.inserted_chars,
            started: self.started,
            finished: self.finished,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub mode: InsertionMode,
    pub original_range: TextRange,
    pub anchor: Position,
    pub initial_anchor: Position,
    pub inserted_chars: usize,
    pub started: bool,
    pub finished: bool,
}

pub struct DocumentState {
    pub document: Arc<dyn TextDocument>,
    pub sessions: BTreeMap<u64, SessionState>,
    pub next_session_id: u64,
    pub edits_applied: u64,
}

impl DocumentState {
    pub fn new(document: Arc<dyn TextDocument>) -> Self {
        Self {
            document,
            sessions: BTreeMap::new(),
            next_session_id: 1,
            edits_applied: 0,
        }
    }

    pub fn register(&mut self, options: SessionOptions) -> u64 {
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions
            .insert(session_id, SessionState::new(session_id, options));
        session_id
    }

    /// Moves every live session ordered after `origin_id` past `edit`.
    /// Returns how many sessions were touched.
    pub fn rebase_after(&mut self, origin_id: u64, edit: &Edit) -> usize {
        self.edits_applied += 1;
        let Some(origin) = self.sessions.get(&origin_id).cloned() else {
            return 0;
        };
        let mut touched = 0;
        for session in self.sessions.values_mut() {
            if session.session_id != origin_id && session.is_after(&origin) {
                session.apply_edit(edit);
                touched += 1;
            }
        }
        touched
    }
}
