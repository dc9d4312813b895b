//! Outbound OAuth delegation.
//!
//! When a network upstream answers 401, the manager parks the connection in
//! `AwaitingOAuth` and exposes this provider's authorization URL. An
//! operator completes the browser leg; `finish_auth` exchanges the code
//! (PKCE, authorization-code grant) and the manager rebuilds the transport
//! with the minted token.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use unimcp_config::OAuthDelegation;

use crate::error::{OutboundError, OutboundResult};

/// PKCE code-verifier plus derived S256 challenge.
#[derive(Debug, Clone)]
struct PkcePair {
    verifier: String,
    challenge: String,
}

fn mint_pkce() -> PkcePair {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).expect("OS random number generator unavailable");
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkcePair {
        verifier,
        challenge,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// Per-upstream OAuth state. Survives transport rebuilds: the manager
/// carries the same provider into the fresh transport after `finish_auth`.
pub struct OAuthProvider {
    delegation: OAuthDelegation,
    server_name: String,
    pkce: RwLock<Option<PkcePair>>,
    access_token: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl OAuthProvider {
    /// Build a provider from the upstream's configured delegation block.
    pub fn new(server_name: impl Into<String>, delegation: OAuthDelegation) -> Self {
        Self {
            delegation,
            server_name: server_name.into(),
            pkce: RwLock::new(None),
            access_token: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }

    /// The URL the operator must visit. Mints a fresh PKCE pair each call;
    /// the matching verifier is held for the eventual exchange.
    pub fn authorization_url(&self) -> String {
        let pkce = mint_pkce();
        let challenge = pkce.challenge.clone();
        *self.pkce.write() = Some(pkce);

        let mut url = self.delegation.authorization_url.clone();
        let sep = if url.contains('?') { '&' } else { '?' };
        let client_id = self.delegation.client_id.as_deref().unwrap_or("unimcp");
        let redirect = self
            .delegation
            .redirect_uri
            .as_deref()
            .unwrap_or("urn:ietf:wg:oauth:2.0:oob");
        url.push_str(&format!(
            "{sep}response_type=code&client_id={}&redirect_uri={}&code_challenge={}&code_challenge_method=S256",
            urlencode(client_id),
            urlencode(redirect),
            challenge,
        ));
        if !self.delegation.scopes.is_empty() {
            url.push_str(&format!(
                "&scope={}",
                urlencode(&self.delegation.scopes.join(" "))
            ));
        }
        url
    }

    /// Exchange an authorization code for an access token.
    pub async fn finish_auth(&self, code: &str) -> OutboundResult<()> {
        let verifier = self
            .pkce
            .write()
            .take()
            .map(|p| p.verifier)
            .ok_or_else(|| {
                OutboundError::connection(format!(
                    "{}: no pending authorization to finish",
                    self.server_name
                ))
            })?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("code_verifier", verifier),
        ];
        if let Some(client_id) = &self.delegation.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(redirect) = &self.delegation.redirect_uri {
            form.push(("redirect_uri", redirect.clone()));
        }

        let response = self
            .http
            .post(&self.delegation.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| OutboundError::connection(format!("token exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OutboundError::connection(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| OutboundError::connection(format!("malformed token response: {e}")))?;
        *self.access_token.write() = Some(token.access_token);
        tracing::info!(server = %self.server_name, "outbound authorization complete");
        Ok(())
    }

    /// The current bearer token, if authorization completed.
    pub fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delegation() -> OAuthDelegation {
        OAuthDelegation {
            authorization_url: "https://issuer.example/authorize".to_string(),
            token_url: "https://issuer.example/token".to_string(),
            client_id: Some("cid".to_string()),
            redirect_uri: Some("http://127.0.0.1:0/cb".to_string()),
            scopes: vec!["mcp read write".to_string()],
        }
    }

    #[test]
    fn authorization_url_carries_pkce_challenge() {
        let provider = OAuthProvider::new("remote", delegation());
        let url = provider.authorization_url();
        assert!(url.starts_with("https://issuer.example/authorize?"));
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("client_id=cid"));
        // Verifier is parked for the exchange.
        assert!(provider.pkce.read().is_some());
        assert!(provider.access_token().is_none());
    }

    #[test]
    fn finish_without_pending_authorization_fails() {
        let provider = OAuthProvider::new("remote", delegation());
        let err = tokio_test::block_on(provider.finish_auth("code")).unwrap_err();
        assert!(matches!(err, OutboundError::ClientConnection(_)));
    }

    #[test]
    fn urlencoding_escapes_reserved() {
        assert_eq!(urlencode("a b/c"), "a%20b%2Fc");
        assert_eq!(urlencode("safe-._~"), "safe-._~");
    }
}
