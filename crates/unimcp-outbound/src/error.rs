//! Error types for the outbound layer.

use thiserror::Error;

/// Result alias for outbound operations.
pub type OutboundResult<T> = Result<T, OutboundError>;

/// Failures surfaced by transports, clients, and the connection manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OutboundError {
    /// Upstream connect or handshake failed; carries the underlying cause.
    #[error("client connection error: {0}")]
    ClientConnection(String),

    /// A request referenced a server name the registry does not hold.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// The upstream identified itself as this proxy.
    #[error("circular dependency: upstream {0:?} reports the proxy's own name")]
    CircularDependency(String),

    /// The operation is invalid for this transport kind.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The upstream requires OAuth; lifecycle, not a failure. Carries the
    /// authorization URL the operator must visit.
    #[error("authorization required: {authorization_url}")]
    OAuthRequired { authorization_url: String },

    /// The upstream payload failed structural validation.
    #[error("schema validation error: {0}")]
    SchemaValidation(String),

    /// The upstream answered with a JSON-RPC error; relayed unchanged.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i32, message: String },

    /// A call exceeded its deadline.
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Transport-level I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed connection key.
    #[error("invalid connection key: {0:?}")]
    InvalidKey(String),

    /// Serialization failure at the wire boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboundError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ClientConnection(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Transient failures worth another attempt; OAuth and circularity are
    /// terminal until an operator intervenes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClientConnection(_) | Self::Transport(_) | Self::Timeout { .. }
        )
    }
}
