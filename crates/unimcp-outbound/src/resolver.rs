//! Read-only resolution from logical server names to live connections.
//!
//! The resolver hides the template key scheme from the dispatch path.
//! Resolution order is strict: per-client instance, then the session's
//! rendered-hash instance, then the static entry.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::key::ConnectionKey;
use crate::manager::{OutboundConnection, OutboundManager};

/// Weak back-index from sessions to their rendered template hashes:
/// `sessionId → { templateName → renderedHash }`.
///
/// Rebuilt by the per-session factory at attach time, dropped at teardown;
/// never mutated in place by readers.
pub type SessionTemplateIndex = Arc<DashMap<String, HashMap<String, String>>>;

/// View adapter over the manager's registry.
#[derive(Clone)]
pub struct ConnectionResolver {
    manager: Arc<OutboundManager>,
    template_index: SessionTemplateIndex,
}

impl ConnectionResolver {
    pub fn new(manager: Arc<OutboundManager>, template_index: SessionTemplateIndex) -> Self {
        Self {
            manager,
            template_index,
        }
    }

    /// The shared session→hash index (the factory writes it).
    pub fn template_index(&self) -> &SessionTemplateIndex {
        &self.template_index
    }

    /// Resolve `(serverName, sessionId?)` to a live connection.
    pub fn resolve(
        &self,
        server_name: &str,
        session_id: Option<&str>,
    ) -> Option<Arc<OutboundConnection>> {
        if let Some(session_id) = session_id {
            // 1. Per-client template instance.
            let key = ConnectionKey::TemplateSession {
                name: server_name.to_string(),
                session_id: session_id.to_string(),
            };
            if let Some(found) = self.manager.get(&key) {
                return Some(found);
            }
            // 2. Shareable instance this session rendered.
            if let Some(hashes) = self.template_index.get(session_id) {
                if let Some(hash) = hashes.get(server_name) {
                    let key = ConnectionKey::TemplateHash {
                        name: server_name.to_string(),
                        hash: hash.clone(),
                    };
                    if let Some(found) = self.manager.get(&key) {
                        return Some(found);
                    }
                }
            }
        }
        // 3. Static entry.
        self.manager
            .get(&ConnectionKey::Static(server_name.to_string()))
    }

    /// The connections a session may see: every static entry, its own
    /// per-client instances, and the shareable instances it joined.
    pub fn filter_for_session(
        &self,
        session_id: &str,
    ) -> HashMap<ConnectionKey, Arc<OutboundConnection>> {
        let hashes = self
            .template_index
            .get(session_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();

        self.manager
            .snapshot()
            .into_iter()
            .filter(|(key, _)| match key {
                ConnectionKey::Static(_) => true,
                ConnectionKey::TemplateSession {
                    session_id: owner, ..
                } => owner == session_id,
                ConnectionKey::TemplateHash { name, hash } => {
                    hashes.get(name).is_some_and(|h| h == hash)
                }
            })
            .collect()
    }

    /// Validate a raw key from the sideband surface, logging and skipping
    /// malformed input (more than one `:` is an invariant violation).
    pub fn parse_key(&self, raw: &str) -> Option<ConnectionKey> {
        match ConnectionKey::parse(raw) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(raw = %raw, error = %e, "rejecting malformed connection key");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use unimcp_config::McpServerParams;

    fn params() -> McpServerParams {
        serde_json::from_value(serde_json::json!({"command": "cat"})).unwrap()
    }

    async fn setup() -> (Arc<OutboundManager>, ConnectionResolver, String) {
        let (manager, _notes) = OutboundManager::new(ManagerConfig {
            max_attempts: 1,
            ..Default::default()
        });
        let index: SessionTemplateIndex = Arc::new(DashMap::new());
        let resolver = ConnectionResolver::new(Arc::clone(&manager), Arc::clone(&index));
        let session = unimcp_core::mint_session_id();

        manager.create_one("fs", params()).await.unwrap();
        manager
            .create_keyed(
                ConnectionKey::TemplateSession {
                    name: "worker".into(),
                    session_id: session.clone(),
                },
                params(),
                None,
            )
            .await
            .unwrap();
        manager
            .create_keyed(
                ConnectionKey::TemplateHash {
                    name: "common".into(),
                    hash: "deadbeef".into(),
                },
                params(),
                None,
            )
            .await
            .unwrap();
        index.insert(
            session.clone(),
            [("common".to_string(), "deadbeef".to_string())]
                .into_iter()
                .collect(),
        );
        (manager, resolver, session)
    }

    #[tokio::test]
    async fn resolution_order() {
        let (_manager, resolver, session) = setup().await;

        // Per-client beats everything.
        let hit = resolver.resolve("worker", Some(&session)).unwrap();
        assert!(matches!(hit.key, ConnectionKey::TemplateSession { .. }));

        // Hash index consulted for shareables.
        let hit = resolver.resolve("common", Some(&session)).unwrap();
        assert!(matches!(hit.key, ConnectionKey::TemplateHash { .. }));

        // Static fallback.
        let hit = resolver.resolve("fs", Some(&session)).unwrap();
        assert!(hit.key.is_static());

        // Unknown name resolves to nothing.
        assert!(resolver.resolve("ghost", Some(&session)).is_none());

        // A session with no index entry cannot reach shareables.
        let other = unimcp_core::mint_session_id();
        assert!(resolver.resolve("common", Some(&other)).is_none());
    }

    #[tokio::test]
    async fn session_filtering() {
        let (_manager, resolver, session) = setup().await;

        let visible = resolver.filter_for_session(&session);
        assert_eq!(visible.len(), 3);

        let stranger = unimcp_core::mint_session_id();
        let visible = resolver.filter_for_session(&stranger);
        // Only the static entry.
        assert_eq!(visible.len(), 1);
        assert!(visible.keys().all(ConnectionKey::is_static));
    }

    #[tokio::test]
    async fn malformed_keys_are_skipped() {
        let (_manager, resolver, _session) = setup().await;
        assert!(resolver.parse_key("a:b:c").is_none());
        assert!(resolver.parse_key("fs").is_some());
    }
}
