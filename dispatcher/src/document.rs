//! Text document abstraction used by the anchor engine.
//!
//! Positions are zero-based `(line, column)` pairs with columns counted in
//! `char`s and lines split on `\n`.

use async_trait::async_trait;
use shared_types::{Position, TextRange};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("position {0} is outside the document")]
    OutOfRange(Position),

    #[error("document rejected edit: {0}")]
    Rejected(String),
}

/// A mutable text buffer addressed by line/column.
#[async_trait]
pub trait TextDocument: Send + Sync {
    /// Stable identity; sessions on documents with equal ids coordinate.
    fn id(&self) -> &str;

    async fn read_range(&self, range: TextRange) -> Result<String, DocumentError>;

    async fn insert(&self, at: Position, text: &str) -> Result<(), DocumentError>;

    async fn delete(&self, range: TextRange) -> Result<(), DocumentError>;

    async fn text(&self) -> String;
}

/// Position immediately after `text` when it is inserted at `at`.
pub fn end_of_insert(at: Position, text: &str) -> Position {
    let breaks = text.matches('\n').count();
    if breaks == 0 {
        return Position::new(at.line, at.column + text.chars().count());
    }
    let last_segment = text.rsplit('\n').next().unwrap_or_default();
    Position::new(at.line + breaks, last_segment.chars().count())
}

/// Range covering everything in `text`, from the origin to its last char.
pub fn full_range(text: &str) -> TextRange {
    TextRange::new(Position::default(), end_of_insert(Position::default(), text))
}

/// In-process document backed by a `String`.
#[derive(Debug)]
pub struct MemoryDocument {
    id: String,
    content: RwLock<String>,
}

impl MemoryDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: RwLock::new(text.into()),
        }
    }

    pub async fn set_text(&self, text: impl Into<String>) {
        *self.content.write().await = text.into();
    }
}

fn byte_offset(content: &str, pos: Position) -> Result<usize, DocumentError> {
    let mut line_start = 0;
    for _ in 0..pos.line {
        match content[line_start..].find('\n') {
            Some(i) => line_start += i + 1,
            None => return Err(DocumentError::OutOfRange(pos)),
        }
    }

    let line_end = content[line_start..]
        .find('\n')
        .map_or(content.len(), |i| line_start + i);
    let line = &content[line_start..line_end];

    match line.char_indices().nth(pos.column) {
        Some((i, _)) => Ok(line_start + i),
        None if line.chars().count() == pos.column => Ok(line_end),
        None => Err(DocumentError::OutOfRange(pos)),
    }
}

fn byte_span(content: &str, range: TextRange) -> Result<(usize, usize), DocumentError> {
    let start = byte_offset(content, range.start)?;
    let end = byte_offset(content, range.end)?;
    Ok((start, end))
}

#[async_trait]
impl TextDocument for MemoryDocument {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_range(&self, range: TextRange) -> Result<String, DocumentError> {
        let content = self.content.read().await;
        let (start, end) = byte_span(&content, range)?;
        Ok(content[start..end].to_string())
    }

    async fn insert(&self, at: Position, text: &str) -> Result<(), DocumentError> {
        let mut content = self.content.write().await;
        let offset = byte_offset(&content, at)?;
        content.insert_str(offset, text);
        Ok(())
    }

    async fn delete(&self, range: TextRange) -> Result<(), DocumentError> {
        let mut content = self.content.write().await;
        let (start, end) = byte_span(&content, range)?;
        content.replace_range(start..end, "");
        Ok(())
    }

    async fn text(&self) -> String {
        self.content.read().await.clone()
    }
}
