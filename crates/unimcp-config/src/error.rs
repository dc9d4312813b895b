//! Configuration error types.

use thiserror::Error;

/// Failures while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid JSON or violates the schema.
    #[error("config parse error: {0}")]
    Parse(String),

    /// The document parsed but its contents are inconsistent.
    #[error("config conflict: {0}")]
    Conflict(String),
}

impl ConfigError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
