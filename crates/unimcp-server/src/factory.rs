//! The per-session template factory.
//!
//! At session attach, every template in the snapshot is rendered against
//! the session's context. Per-client templates always get a fresh upstream
//! keyed `name:sessionId`; shareable ones key by the canonical hash of the
//! rendered params, so sessions with identical rendered configs join one
//! upstream. Shareables are reference-counted and stopped when the last
//! joiner leaves.
//!
//! The factory is a pure function of `(session, snapshot)`: its only
//! output is manager calls plus the rebuilt `sessionId → {template →
//! hash}` back-index the resolver reads.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use unimcp_config::{ConfigSnapshot, TemplateFailureMode};
use unimcp_outbound::{ConnectionKey, OutboundManager, SessionTemplateIndex};
use unimcp_template::{canonical_hash, render_params};

use crate::error::{ProxyError, ProxyResult};
use crate::session::InboundSession;

/// Factory over the outbound manager.
pub struct SessionFactory {
    manager: Arc<OutboundManager>,
    template_index: SessionTemplateIndex,
    /// Joiners per shareable instance: `(template, hash) → sessions`.
    refcounts: DashMap<(String, String), HashSet<String>>,
}

impl SessionFactory {
    pub fn new(manager: Arc<OutboundManager>, template_index: SessionTemplateIndex) -> Self {
        Self {
            manager,
            template_index,
            refcounts: DashMap::new(),
        }
    }

    /// Materialize every enabled template for a session.
    ///
    /// Graceful failure mode renders what it can and logs the rest; strict
    /// mode surfaces the first failure.
    pub async fn attach_session(
        &self,
        session: &Arc<InboundSession>,
        snapshot: &ConfigSnapshot,
    ) -> ProxyResult<()> {
        let context = session.context();
        let mut hashes: HashMap<String, String> = HashMap::new();

        for (name, template) in snapshot.mcp_templates.iter().filter(|(_, p)| !p.disabled) {
            let rendered = match render_params(template, &context) {
                Ok(rendered) => rendered,
                Err(e) => {
                    if snapshot.template_settings.failure_mode == TemplateFailureMode::Strict {
                        return Err(ProxyError::Template(e));
                    }
                    warn!(template = %name, session = %session.id, error = %e, "template render failed, skipping");
                    continue;
                }
            };

            let flags = template.template_params();
            if flags.is_per_client() {
                let key = ConnectionKey::TemplateSession {
                    name: name.clone(),
                    session_id: session.id.clone(),
                };
                self.manager
                    .create_keyed(key, rendered, Some(context.clone()))
                    .await?;
                debug!(template = %name, session = %session.id, "per-client template materialized");
            } else {
                let hash = canonical_hash(&rendered);
                let key = ConnectionKey::TemplateHash {
                    name: name.clone(),
                    hash: hash.clone(),
                };
                let joined = self.manager.get(&key).is_some();
                self.manager
                    .create_keyed(key, rendered, Some(context.clone()))
                    .await?;
                self.refcounts
                    .entry((name.clone(), hash.clone()))
                    .or_default()
                    .insert(session.id.clone());
                hashes.insert(name.clone(), hash.clone());
                debug!(
                    template = %name, session = %session.id, hash = %hash,
                    joined, "shareable template {}", if joined { "joined" } else { "started" }
                );
            }
        }

        // Rebuild, never merge: a reattach after reload replaces the row.
        self.template_index.insert(session.id.clone(), hashes);
        Ok(())
    }

    /// Release a session's template upstreams: per-client instances stop,
    /// shareables stop when their last joiner leaves.
    pub async fn detach_session(&self, session_id: &str) {
        // Per-client instances owned by this session.
        let owned: Vec<ConnectionKey> = self
            .manager
            .snapshot()
            .into_keys()
            .filter(|key| {
                matches!(key, ConnectionKey::TemplateSession { session_id: owner, .. } if owner == session_id)
            })
            .collect();
        for key in owned {
            self.manager.remove_one(&key).await;
        }

        // Shareables this session joined.
        let joined: Vec<(String, String)> = self
            .template_index
            .remove(session_id)
            .map(|(_, hashes)| hashes.into_iter().collect())
            .unwrap_or_default();
        for (name, hash) in joined {
            let stop = {
                let mut entry = self.refcounts.entry((name.clone(), hash.clone())).or_default();
                entry.remove(session_id);
                entry.is_empty()
            };
            if stop {
                self.refcounts.remove(&(name.clone(), hash.clone()));
                let key = ConnectionKey::TemplateHash {
                    name: name.clone(),
                    hash,
                };
                info!(template = %name, "last joiner left, stopping shareable upstream");
                self.manager.remove_one(&key).await;
            }
        }
    }

    /// Re-materialize templates for every given session against a new
    /// snapshot (reload's template reprocessing). Returns the number of
    /// sessions whose reattach failed.
    pub async fn reprocess(
        &self,
        sessions: &[Arc<InboundSession>],
        snapshot: &ConfigSnapshot,
    ) -> usize {
        let mut failures = 0;
        for session in sessions {
            // Drop instances belonging to templates that no longer render
            // the same way; attach recreates or rejoins as needed.
            self.detach_session(&session.id).await;
            if let Err(e) = self.attach_session(session, snapshot).await {
                warn!(session = %session.id, error = %e, "template reprocessing failed");
                failures += 1;
            }
        }
        failures
    }

    /// Drop template instances whose template left the config entirely.
    pub async fn stop_removed_templates(&self, removed: &[String]) {
        let keys: Vec<ConnectionKey> = self
            .manager
            .snapshot()
            .into_keys()
            .filter(|key| !key.is_static() && removed.iter().any(|name| name == key.name()))
            .collect();
        for key in keys {
            self.manager.remove_one(&key).await;
        }
        for name in removed {
            self.refcounts.retain(|(template, _), _| template != name);
            for mut entry in self.template_index.iter_mut() {
                entry.value_mut().remove(name);
            }
        }
    }
}
