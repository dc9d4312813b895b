//! Typed connection keys.
//!
//! The outbound registry is keyed by a sum type, not a string: a static
//! server keys by name alone, a shareable template instance by
//! `name:<renderedHash>`, a per-client instance by `name:<sessionId>`.
//! The string form is a codec for logs and the HTTP sideband; parsing
//! rejects anything with more than one colon.

use std::fmt;

use crate::error::OutboundError;

/// Registry key of one outbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionKey {
    /// A server from `mcpServers`.
    Static(String),
    /// A shareable template instance, identified by its rendered hash.
    TemplateHash { name: String, hash: String },
    /// A per-client template instance, identified by the owning session.
    TemplateSession { name: String, session_id: String },
}

impl ConnectionKey {
    /// Logical server name, independent of instance suffix.
    pub fn name(&self) -> &str {
        match self {
            Self::Static(name)
            | Self::TemplateHash { name, .. }
            | Self::TemplateSession { name, .. } => name,
        }
    }

    /// True for static (non-template) keys.
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }

    /// Parse the string form.
    ///
    /// Suffixes minted by the proxy's session service carry the session-id
    /// prefix, which is how the two template forms are told apart.
    pub fn parse(raw: &str) -> Result<Self, OutboundError> {
        let mut parts = raw.split(':');
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| OutboundError::InvalidKey(raw.to_string()))?;
        match (parts.next(), parts.next()) {
            (None, _) => Ok(Self::Static(name.to_string())),
            (Some(suffix), None) if !suffix.is_empty() => {
                if unimcp_core::id::is_service_id(suffix) {
                    Ok(Self::TemplateSession {
                        name: name.to_string(),
                        session_id: suffix.to_string(),
                    })
                } else {
                    Ok(Self::TemplateHash {
                        name: name.to_string(),
                        hash: suffix.to_string(),
                    })
                }
            }
            _ => Err(OutboundError::InvalidKey(raw.to_string())),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(name) => write!(f, "{name}"),
            Self::TemplateHash { name, hash } => write!(f, "{name}:{hash}"),
            Self::TemplateSession { name, session_id } => write!(f, "{name}:{session_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn static_round_trip() {
        let key = ConnectionKey::parse("fs").unwrap();
        assert_eq!(key, ConnectionKey::Static("fs".into()));
        assert_eq!(key.to_string(), "fs");
        assert!(key.is_static());
    }

    #[test]
    fn session_suffix_recognized_by_prefix() {
        let sid = unimcp_core::mint_session_id();
        let key = ConnectionKey::parse(&format!("worker:{sid}")).unwrap();
        assert_eq!(
            key,
            ConnectionKey::TemplateSession {
                name: "worker".into(),
                session_id: sid.clone(),
            }
        );
        assert_eq!(key.to_string(), format!("worker:{sid}"));
    }

    #[test]
    fn hash_suffix_recognized() {
        let key = ConnectionKey::parse("common:a1b2c3d4").unwrap();
        assert_eq!(
            key,
            ConnectionKey::TemplateHash {
                name: "common".into(),
                hash: "a1b2c3d4".into(),
            }
        );
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!(ConnectionKey::parse("a:b:c").is_err());
        assert!(ConnectionKey::parse("").is_err());
        assert!(ConnectionKey::parse("name:").is_err());
    }
}
