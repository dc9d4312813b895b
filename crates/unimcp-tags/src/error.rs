//! Error types for tag parsing and preset resolution.

use thiserror::Error;

/// Failures surfaced by the tag query language.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TagError {
    /// The advanced expression failed to parse. `pos` is the byte column
    /// of the offending character in the input.
    #[error("invalid tag expression at column {pos}: {msg}")]
    InvalidExpression { pos: usize, msg: String },

    /// A tag name violated `[A-Za-z0-9_-]{1,64}`.
    #[error("invalid tag name: {0:?}")]
    InvalidTag(String),

    /// A tag-query object was structurally malformed.
    #[error("invalid tag query: {0}")]
    InvalidQuery(String),

    /// A preset was requested that the store does not hold.
    #[error("unknown preset: {0:?}")]
    UnknownPreset(String),

    /// Preset store I/O failed.
    #[error("preset store error: {0}")]
    Store(String),
}

impl TagError {
    pub(crate) fn at(pos: usize, msg: impl Into<String>) -> Self {
        Self::InvalidExpression {
            pos,
            msg: msg.into(),
        }
    }
}
