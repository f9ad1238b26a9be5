//! Shared types between the dispatcher library and its callers
//!
//! These types are used by:
//! - the scheduler and provider client (rate hints, limits, body modes)
//! - the anchor engine and document adapters (positions, ranges, modes)
//!
//! Serializable with serde so they can travel through config files and logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Document Coordinates
// ============================================================================

/// Zero-based `(line, column)` position; columns count `char`s.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Half-open range `[start, end)` in document coordinates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TextRange {
    pub start: Position,
    pub end: Position,
}

impl TextRange {
    /// Builds a range, swapping the endpoints if they are reversed.
    pub fn new(start: Position, end: Position) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    /// Zero-width range at `at`.
    pub fn empty(at: Position) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of line breaks covered by the range.
    pub fn line_span(&self) -> usize {
        self.end.line - self.start.line
    }
}

impl fmt::Display for TextRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ============================================================================
// Insertion
// ============================================================================

/// Where streamed output lands relative to the selected range.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsertionMode {
    /// Keep the selection, write after its end.
    #[default]
    Append,
    /// Delete the selection, write in its place.
    Replace,
}

impl FromStr for InsertionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            other => Err(format!(
                "invalid insertion mode '{other}', expected 'append' or 'replace'"
            )),
        }
    }
}

// ============================================================================
// Provider Requests
// ============================================================================

/// Shape of the outbound request body.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyMode {
    /// Pick from the request path.
    #[default]
    Auto,
    /// `{"messages": [...]}`
    Chat,
    /// `{"prompt": "..."}`
    Completion,
}

impl FromStr for BodyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "chat" => Ok(Self::Chat),
            "completion" | "completions" => Ok(Self::Completion),
            other => Err(format!(
                "invalid body mode '{other}', expected 'auto', 'chat' or 'completion'"
            )),
        }
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Server-supplied rate metadata extracted from a single response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerRateHint {
    /// Minimum wait before the next request, in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// Revised requests-per-minute budget advertised by the server.
    pub limit_per_minute_hint: Option<u32>,
}

impl ServerRateHint {
    /// Longest wait a server can impose through a single hint.
    pub const MAX_RETRY_AFTER_MS: u64 = 5 * 60 * 1_000;

    /// Caps `retry_after_ms` at [`Self::MAX_RETRY_AFTER_MS`].
    pub fn clamped(self) -> Self {
        Self {
            retry_after_ms: self
                .retry_after_ms
                .map(|ms| ms.min(Self::MAX_RETRY_AFTER_MS)),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.retry_after_ms.is_none() && self.limit_per_minute_hint.is_none()
    }
}

/// Admission caps enforced by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimits {
    pub max_concurrency: usize,
    pub max_per_minute: u32,
}

impl RateLimits {
    pub fn new(max_concurrency: usize, max_per_minute: u32) -> Self {
        Self {
            max_concurrency,
            max_per_minute,
        }
        .normalized()
    }

    /// Clamps both caps to at least one.
    pub fn normalized(self) -> Self {
        Self {
            max_concurrency: self.max_concurrency.max(1),
            max_per_minute: self.max_per_minute.max(1),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_per_minute: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_new_orders_endpoints() {
        let range = TextRange::new(Position::new(4, 2), Position::new(1, 7));
        assert_eq!(range.start, Position::new(1, 7));
        assert_eq!(range.end, Position::new(4, 2));
        assert_eq!(range.line_span(), 3);
    }

    #[test]
    fn test_position_orders_by_line_then_column() {
        assert!(Position::new(1, 9) < Position::new(2, 0));
        assert!(Position::new(2, 1) < Position::new(2, 3));
    }

    #[test]
    fn test_insertion_mode_parse() {
        assert_eq!("Replace".parse::<InsertionMode>(), Ok(InsertionMode::Replace));
        assert_eq!(" append ".parse::<InsertionMode>(), Ok(InsertionMode::Append));
        assert!("prepend".parse::<InsertionMode>().is_err());
    }

    #[test]
    fn test_body_mode_parse_accepts_plural() {
        assert_eq!("completions".parse::<BodyMode>(), Ok(BodyMode::Completion));
        assert_eq!("chat".parse::<BodyMode>(), Ok(BodyMode::Chat));
    }

    #[test]
    fn test_rate_limits_clamp_to_one() {
        let limits = RateLimits::new(0, 0);
        assert_eq!(limits.max_concurrency, 1);
        assert_eq!(limits.max_per_minute, 1);
    }

    #[test]
    fn test_rate_hint_clamp_caps_retry_after_only() {
        let hint = ServerRateHint {
            retry_after_ms: Some(u64::MAX),
            limit_per_minute_hint: Some(30),
        }
        .clamped();
        assert_eq!(hint.retry_after_ms, Some(ServerRateHint::MAX_RETRY_AFTER_MS));
        assert_eq!(hint.limit_per_minute_hint, Some(30));

        let short = ServerRateHint {
            retry_after_ms: Some(1_500),
            limit_per_minute_hint: None,
        };
        assert_eq!(short.clamped(), short);
    }

    #[test]
    fn test_rate_hint_serde_roundtrip_keeps_missing_fields() {
        let hint: ServerRateHint =
            serde_json::from_str(r#"{"retry_after_ms": 1500, "limit_per_minute_hint": null}"#)
                .unwrap();
        assert_eq!(hint.retry_after_ms, Some(1500));
        assert!(hint.limit_per_minute_hint.is_none());
        assert!(!hint.is_empty());
    }
}
