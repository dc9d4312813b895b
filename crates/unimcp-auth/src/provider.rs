//! The OAuth 2.1 authorization server.
//!
//! Authorization Code + PKCE only. Codes are one-shot and short-lived;
//! tokens are opaque `umcp_…` strings whose lifetime matches the session
//! TTL; consent is auto-approved when configured (consent rendering is an
//! outer-surface concern). Refresh tokens are not supported.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::error::AuthError;
use crate::scopes::{scope_to_tag, tags_to_scopes};
use crate::storage::{OAuthStorage, keys};

/// Prefix on every access token this issuer mints.
pub const TOKEN_PREFIX: &str = "umcp_";

/// Issuer configuration.
#[derive(Debug, Clone)]
pub struct AuthProviderConfig {
    /// When false, `verify_access_token` grants anonymous full access.
    pub enabled: bool,
    /// Access-token (and session) lifetime.
    pub session_ttl: Duration,
    /// Authorization-code lifetime; clamped to 60 s.
    pub code_ttl: Duration,
    /// Client-registration lifetime.
    pub client_ttl: Duration,
    pub auto_approve: bool,
}

impl Default for AuthProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            code_ttl: Duration::from_secs(60),
            client_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            auto_approve: true,
        }
    }
}

/// A registered client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    pub redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `POST /register` body.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterParams {
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// `GET /authorize` query.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    pub code_challenge: String,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
}

/// `POST /token` form.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenParams {
    pub grant_type: String,
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub resource: Option<String>,
}

/// `POST /token` response.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub scope: String,
}

/// Result of `verify_access_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resource: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StoredCode {
    client_id: String,
    redirect_uri: String,
    resource: Option<String>,
    scopes: Vec<String>,
    code_challenge: String,
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    client_id: String,
    resource: Option<String>,
    scopes: Vec<String>,
    expires: DateTime<Utc>,
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf).expect("OS random number generator unavailable");
    URL_SAFE_NO_PAD.encode(buf)
}

/// The issuer.
pub struct AuthProvider {
    config: AuthProviderConfig,
    storage: OAuthStorage,
}

impl AuthProvider {
    pub fn new(config: AuthProviderConfig, storage: OAuthStorage) -> Self {
        Self { config, storage }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Dynamic client registration.
    pub async fn register(
        &self,
        params: RegisterParams,
    ) -> Result<ClientRegistration, AuthError> {
        if params.redirect_uris.is_empty() {
            return Err(AuthError::InvalidRequest(
                "redirect_uris must not be empty".to_string(),
            ));
        }
        for uri in &params.redirect_uris {
            if !(uri.starts_with("https://")
                || uri.starts_with("http://127.0.0.1")
                || uri.starts_with("http://localhost"))
            {
                return Err(AuthError::InvalidRequest(format!(
                    "redirect uri {uri:?} must be https or loopback"
                )));
            }
        }

        let registration = ClientRegistration {
            client_id: random_token(16),
            redirect_uris: params.redirect_uris,
            client_name: params.client_name,
            created_at: Utc::now(),
        };
        tracing::info!(client = %registration.client_id, "client registered");
        self.storage
            .clients
            .save(
                &format!("{}{}", keys::CLIENTS, registration.client_id),
                serde_json::to_value(&registration)
                    .map_err(|e| AuthError::Storage(e.to_string()))?,
                self.config.client_ttl,
            )
            .await?;
        Ok(registration)
    }

    async fn load_client(&self, client_id: &str) -> Result<ClientRegistration, AuthError> {
        let value = self
            .storage
            .clients
            .get(&format!("{}{client_id}", keys::CLIENTS))
            .await?
            .ok_or_else(|| AuthError::InvalidClient(format!("unknown client {client_id:?}")))?;
        serde_json::from_value(value).map_err(|e| AuthError::Storage(e.to_string()))
    }

    /// Validate an authorization request and mint a one-shot code.
    ///
    /// Scope validation is against the live tag universe: `tag:<t>` is
    /// valid iff `<t>` is configured on some server. The caller redirects
    /// the user agent to `redirect_uri?code=…&state=…`.
    pub async fn authorize(
        &self,
        available_tags: &[String],
        params: AuthorizeParams,
    ) -> Result<String, AuthError> {
        if params.response_type.as_deref().is_some_and(|r| r != "code") {
            return Err(AuthError::InvalidRequest(
                "only response_type=code is supported".to_string(),
            ));
        }
        if params
            .code_challenge_method
            .as_deref()
            .is_some_and(|m| m != "S256")
        {
            return Err(AuthError::InvalidRequest(
                "only S256 code challenges are supported".to_string(),
            ));
        }
        if params.code_challenge.is_empty() {
            return Err(AuthError::InvalidRequest(
                "code_challenge is required".to_string(),
            ));
        }

        let client = self.load_client(&params.client_id).await?;
        if !client.redirect_uris.contains(&params.redirect_uri) {
            return Err(AuthError::InvalidClient(format!(
                "redirect uri {:?} not registered",
                params.redirect_uri
            )));
        }

        let scopes: Vec<String> = params
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        for scope in &scopes {
            let tag = scope_to_tag(scope)
                .ok_or_else(|| AuthError::InvalidScope(format!("unknown scope {scope:?}")))?;
            if !available_tags.iter().any(|t| t == tag) {
                return Err(AuthError::InvalidScope(format!(
                    "no configured server carries tag {tag:?}"
                )));
            }
        }

        // Consent: rendering is out of scope; non-auto-approve deployments
        // front this with their own consent surface.
        let _ = self.config.auto_approve;

        let code = random_token(24);
        let stored = StoredCode {
            client_id: params.client_id,
            redirect_uri: params.redirect_uri.clone(),
            resource: params.resource,
            scopes,
            code_challenge: params.code_challenge,
        };
        let ttl = self.config.code_ttl.min(Duration::from_secs(60));
        self.storage
            .codes
            .save(
                &format!("{}{code}", keys::CODES),
                serde_json::to_value(&stored).map_err(|e| AuthError::Storage(e.to_string()))?,
                ttl,
            )
            .await?;

        let mut location = format!(
            "{}{}code={code}",
            params.redirect_uri,
            if params.redirect_uri.contains('?') { "&" } else { "?" },
        );
        if let Some(state) = params.state {
            location.push_str("&state=");
            location.push_str(&state);
        }
        Ok(location)
    }

    /// Exchange an authorization code for an access token. The code is
    /// deleted before validation, so a second use always fails.
    pub async fn exchange_authorization_code(
        &self,
        params: TokenParams,
    ) -> Result<TokenResponse, AuthError> {
        if params.grant_type != "authorization_code" {
            return Err(AuthError::InvalidRequest(format!(
                "unsupported grant_type {:?}",
                params.grant_type
            )));
        }

        let code_key = format!("{}{}", keys::CODES, params.code);
        let stored = self.storage.codes.get(&code_key).await?;
        // One-shot: gone from storage before any check can fail.
        self.storage.codes.delete(&code_key).await?;
        let stored: StoredCode = stored
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or_else(|| AuthError::InvalidGrant("unknown or used code".to_string()))?;

        if stored.client_id != params.client_id {
            return Err(AuthError::InvalidClient("client mismatch".to_string()));
        }
        if stored.redirect_uri != params.redirect_uri {
            return Err(AuthError::InvalidGrant("redirect uri mismatch".to_string()));
        }
        if let (Some(bound), Some(requested)) = (&stored.resource, &params.resource) {
            if bound != requested {
                return Err(AuthError::InvalidGrant("resource mismatch".to_string()));
            }
        }

        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(params.code_verifier.as_bytes()));
        if challenge
            .as_bytes()
            .ct_eq(stored.code_challenge.as_bytes())
            .unwrap_u8()
            != 1
        {
            return Err(AuthError::InvalidGrant("pkce verification failed".to_string()));
        }

        let token = format!("{TOKEN_PREFIX}{}", random_token(32));
        let expires = Utc::now()
            + ChronoDuration::from_std(self.config.session_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(24));
        let session = StoredSession {
            client_id: stored.client_id,
            resource: stored.resource,
            scopes: stored.scopes.clone(),
            expires,
        };
        self.storage
            .sessions
            .save(
                &format!("{}{token}", keys::SESSIONS),
                serde_json::to_value(&session).map_err(|e| AuthError::Storage(e.to_string()))?,
                self.config.session_ttl,
            )
            .await?;

        tracing::info!(
            client = %session.client_id,
            scopes = %stored.scopes.join(" "),
            "access token issued"
        );
        Ok(TokenResponse {
            access_token: token,
            token_type: "Bearer",
            expires_in: self.config.session_ttl.as_secs(),
            scope: stored.scopes.join(" "),
        })
    }

    /// Resolve a bearer token. With auth disabled, every caller is the
    /// anonymous client holding every configured tag.
    pub async fn verify_access_token(
        &self,
        available_tags: &[String],
        token: &str,
    ) -> Result<AuthInfo, AuthError> {
        if !self.config.enabled {
            return Ok(AuthInfo {
                client_id: "anonymous".to_string(),
                scopes: tags_to_scopes(available_tags),
                expires_at: None,
                resource: None,
            });
        }

        if !token.starts_with(TOKEN_PREFIX) {
            return Err(AuthError::InvalidGrant("malformed token".to_string()));
        }
        let value = self
            .storage
            .sessions
            .get(&format!("{}{token}", keys::SESSIONS))
            .await?
            .ok_or_else(|| AuthError::InvalidGrant("unknown or expired token".to_string()))?;
        let session: StoredSession =
            serde_json::from_value(value).map_err(|e| AuthError::Storage(e.to_string()))?;
        if session.expires < Utc::now() {
            return Err(AuthError::InvalidGrant("token expired".to_string()));
        }
        Ok(AuthInfo {
            client_id: session.client_id,
            scopes: session.scopes,
            expires_at: Some(session.expires),
            resource: session.resource,
        })
    }

    /// Best-effort revocation.
    pub async fn revoke_token(&self, token: &str) {
        let _ = self
            .storage
            .sessions
            .delete(&format!("{}{token}", keys::SESSIONS))
            .await;
    }

    /// `.well-known/oauth-authorization-server` document.
    pub fn metadata(&self, issuer: &str, available_tags: &[String]) -> Value {
        serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "revocation_endpoint": format!("{issuer}/revoke"),
            "registration_endpoint": format!("{issuer}/register"),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["none"],
            "scopes_supported": tags_to_scopes(available_tags),
        })
    }
}
