//! The top-level error type and the single errors→responses boundary.
//!
//! Core components return their own `Result` sums; everything converges
//! here, and only the HTTP layer turns these into status codes and JSON
//! bodies.

use thiserror::Error;
use unimcp_protocol::jsonrpc::{JsonRpcError, error_codes};

/// Result alias for proxy-level operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Everything that can go wrong at the proxy boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    #[error(transparent)]
    Outbound(#[from] unimcp_outbound::OutboundError),

    #[error(transparent)]
    Auth(#[from] unimcp_auth::AuthError),

    #[error(transparent)]
    Config(#[from] unimcp_config::ConfigError),

    #[error(transparent)]
    Tags(#[from] unimcp_tags::TagError),

    #[error("template error: {0}")]
    Template(#[from] unimcp_template::TemplateError),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status for the JSON error envelope.
    pub fn http_status(&self) -> u16 {
        use unimcp_auth::AuthError;
        use unimcp_outbound::OutboundError;
        match self {
            Self::InvalidParams(_) | Self::Config(_) | Self::Tags(_) | Self::Template(_) => 400,
            Self::Auth(AuthError::RateLimited { .. }) => 429,
            Self::Auth(AuthError::InvalidClient(_)) | Self::Auth(AuthError::InvalidGrant(_)) => 401,
            Self::Auth(AuthError::InvalidScope(_)) | Self::Auth(AuthError::InvalidRequest(_)) => {
                400
            }
            Self::Auth(AuthError::Storage(_)) => 500,
            Self::UnknownSession(_) | Self::Outbound(OutboundError::ClientNotFound(_)) => 404,
            Self::Outbound(OutboundError::OAuthRequired { .. }) => 401,
            Self::Outbound(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        use unimcp_outbound::OutboundError;
        match self {
            Self::InvalidParams(_) => "invalid_params",
            Self::Config(_) => "config_error",
            Self::Tags(_) => "invalid_tag_expression",
            Self::Template(_) => "template_error",
            Self::Auth(e) => e.oauth_code(),
            Self::UnknownSession(_) => "unknown_session",
            Self::Outbound(OutboundError::ClientNotFound(_)) => "client_not_found",
            Self::Outbound(OutboundError::CircularDependency(_)) => "circular_dependency",
            Self::Outbound(OutboundError::UnsupportedTransport(_)) => "unsupported_transport",
            Self::Outbound(OutboundError::OAuthRequired { .. }) => "oauth_required",
            Self::Outbound(OutboundError::Timeout { .. }) => "timeout",
            Self::Outbound(_) => "upstream_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Render as a JSON-RPC error payload. Upstream error text passes
    /// through unchanged.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        use unimcp_outbound::OutboundError;
        match self {
            Self::Outbound(OutboundError::Upstream { code, message }) => {
                JsonRpcError::new(*code, message.clone())
            }
            Self::Outbound(OutboundError::Timeout { .. }) => {
                JsonRpcError::new(error_codes::REQUEST_TIMEOUT, self.to_string())
            }
            Self::Outbound(OutboundError::ClientNotFound(_)) | Self::UnknownSession(_) => {
                JsonRpcError::new(error_codes::NOT_FOUND, self.to_string())
            }
            Self::InvalidParams(_) | Self::Tags(_) => JsonRpcError::invalid_params(self.to_string()),
            _ => JsonRpcError::internal(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_pass_through_unchanged() {
        let err = ProxyError::from(unimcp_outbound::OutboundError::Upstream {
            code: -32000,
            message: "disk on fire".to_string(),
        });
        let rpc = err.to_jsonrpc();
        assert_eq!(rpc.code, -32000);
        assert_eq!(rpc.message, "disk on fire");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::invalid_params("x").http_status(), 400);
        assert_eq!(ProxyError::UnknownSession("s".into()).http_status(), 404);
        assert_eq!(
            ProxyError::from(unimcp_auth::AuthError::RateLimited {
                retry_after_secs: 3
            })
            .http_status(),
            429
        );
        assert_eq!(ProxyError::internal("x").http_status(), 500);
    }
}
