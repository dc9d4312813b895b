//! OAuth error taxonomy.

use thiserror::Error;

/// Failures on the inbound auth surface. Maps one-to-one onto the OAuth
/// error codes the HTTP layer renders.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid_scope: {0}")]
    InvalidScope(String),

    #[error("invalid_client: {0}")]
    InvalidClient(String),

    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// The `error` field of an RFC 6749 error response.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::InvalidScope(_) => "invalid_scope",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "slow_down",
            Self::Storage(_) => "server_error",
        }
    }
}
