//! Inbound OAuth 2.1 issuance.
//!
//! The proxy is its own authorization server: scopes map one-to-one onto
//! configured server tags (`tag:<tag>`), access tokens are opaque prefixed
//! strings with the session TTL, authorization codes are one-shot PKCE
//! carriers, and refresh tokens are not issued. When auth is disabled the
//! verifier hands out an anonymous grant covering every configured tag.

pub mod error;
pub mod provider;
pub mod rate_limit;
pub mod scopes;
pub mod storage;

pub use error::AuthError;
pub use provider::{
    AuthInfo, AuthProvider, AuthProviderConfig, AuthorizeParams, ClientRegistration,
    RegisterParams, TokenParams, TokenResponse,
};
pub use rate_limit::SlidingWindowLimiter;
pub use scopes::{scope_to_tag, scopes_to_expression, tag_to_scope, tags_to_scopes};
pub use storage::{KeyValueRepository, MemoryRepository, OAuthStorage, keys};
