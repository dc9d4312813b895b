//! The capability aggregator.
//!
//! Two paths serve list requests:
//!
//! - **merged** (session pagination off): every visible upstream is queried
//!   concurrently; failing upstreams are logged and omitted, never fatal.
//! - **paged** (session pagination on): upstreams are walked in lexical
//!   order, one upstream page per request, with the combined position
//!   encoded in an opaque [`crate::cursor`] value.
//!
//! Independently, `refresh_all` populates the [`ToolRegistry`] cache that
//! backs the meta-tool façade, capability change detection, and the
//! per-session view diffing done during reload.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use unimcp_core::ParallelExecutor;
use unimcp_outbound::{ConnectionKey, ConnectionStatus, OutboundConnection};
use unimcp_protocol::types::methods;
use unimcp_tags::{FilterCache, TagExpression};

use crate::registry::{ServerCatalog, ToolRegistry};
use crate::schema_cache::SchemaCache;

/// Upstream list categories the aggregator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Tools,
    Resources,
    ResourceTemplates,
    Prompts,
}

impl Category {
    fn method(self) -> &'static str {
        match self {
            Self::Tools => methods::TOOLS_LIST,
            Self::Resources => methods::RESOURCES_LIST,
            Self::ResourceTemplates => methods::RESOURCES_TEMPLATES_LIST,
            Self::Prompts => methods::PROMPTS_LIST,
        }
    }

    fn items_field(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::ResourceTemplates => "resourceTemplates",
            Self::Prompts => "prompts",
        }
    }
}

/// A tag-filtered snapshot of the registry cache.
#[derive(Debug, Clone, Default)]
pub struct AggregateView {
    /// `(logical server, tool)` pairs.
    pub tools: Vec<(String, unimcp_protocol::Tool)>,
    pub resources: Vec<(String, unimcp_protocol::Resource)>,
    pub resource_templates: Vec<(String, unimcp_protocol::ResourceTemplate)>,
    pub prompts: Vec<(String, unimcp_protocol::Prompt)>,
}

impl AggregateView {
    /// `server/name` identifiers per category, used for change diffing.
    pub fn qualified(&self) -> QualifiedSets {
        QualifiedSets {
            tools: self
                .tools
                .iter()
                .map(|(s, t)| format!("{s}/{}", t.name))
                .collect(),
            resources: self
                .resources
                .iter()
                .map(|(s, r)| format!("{s}/{}", r.uri))
                .collect(),
            prompts: self
                .prompts
                .iter()
                .map(|(s, p)| format!("{s}/{}", p.name))
                .collect(),
        }
    }
}

/// Per-category qualified-name sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualifiedSets {
    pub tools: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    pub prompts: BTreeSet<String>,
}

/// What changed in one category between two refreshes.
#[derive(Debug, Clone, Default)]
pub struct CategoryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub current: Vec<String>,
    pub previous: Vec<String>,
}

impl CategoryChange {
    fn between(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Self {
        Self {
            added: current.difference(previous).cloned().collect(),
            removed: previous.difference(current).cloned().collect(),
            current: current.iter().cloned().collect(),
            previous: previous.iter().cloned().collect(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Capability deltas across all three notifying categories.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub tools: CategoryChange,
    pub resources: CategoryChange,
    pub prompts: CategoryChange,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        self.tools.has_changes() || self.resources.has_changes() || self.prompts.has_changes()
    }
}

/// The aggregator. One per process, shared via `Arc`.
pub struct Aggregator {
    registry: Arc<ToolRegistry>,
    schema_cache: SchemaCache,
    filter_cache: FilterCache,
    executor: ParallelExecutor,
    previous: Mutex<QualifiedSets>,
}

/// Hard bound on pagination drain loops; a misbehaving upstream that hands
/// out endless cursors must not wedge a refresh.
const MAX_PAGES_PER_UPSTREAM: usize = 64;

impl Aggregator {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            registry: Arc::new(ToolRegistry::new()),
            schema_cache: SchemaCache::default(),
            filter_cache: FilterCache::default(),
            executor: ParallelExecutor::new(max_concurrent),
            previous: Mutex::new(QualifiedSets::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    pub fn filter_cache(&self) -> &FilterCache {
        &self.filter_cache
    }

    /// Keep only connections that are connected and whose server tags pass
    /// the session's expression, in lexical name order. `None` means no
    /// filter; the empty expression matches nothing.
    pub fn filter_visible(
        &self,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
    ) -> Vec<(ConnectionKey, Arc<OutboundConnection>)> {
        let mut out: Vec<(ConnectionKey, Arc<OutboundConnection>)> = visible
            .iter()
            .filter(|(_, c)| c.status() == ConnectionStatus::Connected)
            .filter(|(_, c)| match expr {
                Some(expr) => self.filter_cache.matches(expr, &c.tags()),
                None => true,
            })
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Refresh the registry cache from every connected upstream in the
    /// snapshot. Entries for vanished keys are dropped; a failing upstream
    /// loses its entry and is logged, the batch always completes.
    pub async fn refresh_all(&self, snapshot: &HashMap<ConnectionKey, Arc<OutboundConnection>>) {
        // Drop catalogs whose connection is gone.
        let live: BTreeSet<String> = snapshot.keys().map(ToString::to_string).collect();
        for (key, _) in self.registry.snapshot() {
            if !live.contains(&key) {
                self.registry.remove(&key);
            }
        }

        let inputs: Vec<(ConnectionKey, Arc<OutboundConnection>)> = snapshot
            .iter()
            .filter(|(_, c)| c.status() == ConnectionStatus::Connected)
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();

        let registry = Arc::clone(&self.registry);
        let outcome = self
            .executor
            .run(
                inputs,
                move |(key, connection)| {
                    let registry = Arc::clone(&registry);
                    async move {
                        match Self::fetch_catalog(&key, &connection).await {
                            Ok(catalog) => {
                                registry.replace(catalog);
                                Ok(())
                            }
                            Err(e) => {
                                registry.remove(&key.to_string());
                                Err(e)
                            }
                        }
                    }
                },
                None,
            )
            .await;

        for (input, result) in &outcome.results {
            if let Err(e) = result {
                warn!(key = %input.0, error = %e, "capability refresh failed, omitting server");
            }
        }
        debug!(
            refreshed = outcome.results.len() - outcome.failed(),
            failed = outcome.failed(),
            "capability refresh complete"
        );
    }

    async fn fetch_catalog(
        key: &ConnectionKey,
        connection: &Arc<OutboundConnection>,
    ) -> Result<ServerCatalog, unimcp_outbound::OutboundError> {
        let client = connection
            .client()
            .ok_or_else(|| unimcp_outbound::OutboundError::connection("not connected"))?;

        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_PAGES_PER_UPSTREAM {
            let page = client.list_tools(cursor.take()).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Resources, templates, and prompts are optional capabilities;
        // method-not-found answers mean "none", not failure.
        let resources = match client.list_resources(None).await {
            Ok(r) => r.resources,
            Err(unimcp_outbound::OutboundError::Upstream { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let resource_templates = match client.list_resource_templates(None).await {
            Ok(r) => r.resource_templates,
            Err(unimcp_outbound::OutboundError::Upstream { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let prompts = match client.list_prompts(None).await {
            Ok(p) => p.prompts,
            Err(unimcp_outbound::OutboundError::Upstream { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(ServerCatalog {
            server: key.name().to_string(),
            connection_key: key.to_string(),
            tags: connection.tags(),
            tools,
            resources,
            resource_templates,
            prompts,
            instructions: connection.instructions(),
        })
    }

    /// Compute a session's view from the registry cache.
    pub fn compute_view(
        &self,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
    ) -> AggregateView {
        let mut view = AggregateView::default();
        for (key, _) in self.filter_visible(visible, expr) {
            let Some(catalog) = self.registry.get(&key.to_string()) else {
                continue;
            };
            for tool in &catalog.tools {
                view.tools.push((catalog.server.clone(), tool.clone()));
            }
            for resource in &catalog.resources {
                view.resources
                    .push((catalog.server.clone(), resource.clone()));
            }
            for template in &catalog.resource_templates {
                view.resource_templates
                    .push((catalog.server.clone(), template.clone()));
            }
            for prompt in &catalog.prompts {
                view.prompts.push((catalog.server.clone(), prompt.clone()));
            }
        }
        view
    }

    /// Recompute the global (unfiltered) qualified sets and diff against
    /// the previous refresh. Called by the reload engine after upstream
    /// changes settle.
    pub fn update_capabilities(
        &self,
        snapshot: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
    ) -> ChangeSet {
        let current = self.compute_view(snapshot, None).qualified();
        let mut previous_guard = self.previous.lock();
        let previous = std::mem::replace(&mut *previous_guard, current.clone());
        ChangeSet {
            tools: CategoryChange::between(&previous.tools, &current.tools),
            resources: CategoryChange::between(&previous.resources, &current.resources),
            prompts: CategoryChange::between(&previous.prompts, &current.prompts),
        }
    }

    /// Merged live listing: query all visible upstreams concurrently,
    /// omitting failures. Items carry `_meta.server`.
    pub async fn list_merged(
        &self,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
        category: Category,
    ) -> Vec<Value> {
        let targets = self.filter_visible(visible, expr);
        let outcome = self
            .executor
            .run(
                targets,
                move |(key, connection)| async move {
                    Self::drain_upstream(&key, &connection, category).await
                },
                None,
            )
            .await;

        let mut merged = Vec::new();
        for ((key, _), result) in outcome.results {
            match result {
                Ok(items) => merged.extend(items),
                Err(e) => {
                    warn!(key = %key, method = category.method(), error = %e, "upstream listing failed, omitting");
                }
            }
        }
        merged
    }

    async fn drain_upstream(
        key: &ConnectionKey,
        connection: &Arc<OutboundConnection>,
        category: Category,
    ) -> Result<Vec<Value>, unimcp_outbound::OutboundError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES_PER_UPSTREAM {
            let (page, next) = Self::fetch_page(key, connection, category, cursor.take()).await?;
            items.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    async fn fetch_page(
        key: &ConnectionKey,
        connection: &Arc<OutboundConnection>,
        category: Category,
        cursor: Option<String>,
    ) -> Result<(Vec<Value>, Option<String>), unimcp_outbound::OutboundError> {
        let client = connection
            .client()
            .ok_or_else(|| unimcp_outbound::OutboundError::connection("not connected"))?;
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let raw = client.call(category.method(), params).await?;

        let next = raw
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let server = key.name();
        let items = raw
            .get(category.items_field())
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .cloned()
                    .map(|mut item| {
                        if let Some(object) = item.as_object_mut() {
                            let meta = object
                                .entry("_meta")
                                .or_insert_with(|| Value::Object(Default::default()));
                            if let Some(meta) = meta.as_object_mut() {
                                meta.insert(
                                    "server".to_string(),
                                    Value::String(server.to_string()),
                                );
                            }
                        }
                        item
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((items, next))
    }

    /// Paged live listing: one upstream page per call, clients walked in
    /// lexical order. Returns `(items, nextCursor)`. An invalid inbound
    /// cursor resets to the first client and logs a warning.
    pub async fn list_paged(
        &self,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
        category: Category,
        cursor_raw: Option<&str>,
    ) -> (Vec<Value>, Option<String>) {
        let targets = self.filter_visible(visible, expr);
        if targets.is_empty() {
            return (Vec::new(), None);
        }

        // Resume position from the cursor, or the first client.
        let (mut index, mut upstream_cursor) = match cursor_raw {
            None | Some("") => (0, None),
            Some(raw) => match crate::cursor::decode_cursor(raw) {
                Some(cursor) => {
                    let index = targets
                        .iter()
                        .position(|(key, _)| key.name() == cursor.client);
                    match index {
                        Some(index) => (index, cursor.upstream),
                        None => {
                            // The named client left the fleet; restart.
                            warn!(cursor = %raw, "cursor names unknown client, restarting walk");
                            (0, None)
                        }
                    }
                }
                None => {
                    warn!(cursor = %raw, "invalid pagination cursor, restarting walk");
                    (0, None)
                }
            },
        };

        // Skip failing upstreams rather than wedging the walk.
        while index < targets.len() {
            let (key, connection) = &targets[index];
            match Self::fetch_page(key, connection, category, upstream_cursor.take()).await {
                Ok((items, next)) => {
                    let next_cursor = match next {
                        Some(upstream) => {
                            Some(crate::cursor::encode_cursor(key.name(), Some(&upstream)))
                        }
                        None => targets
                            .get(index + 1)
                            .map(|(next_key, _)| crate::cursor::encode_cursor(next_key.name(), None)),
                    };
                    return (items, next_cursor);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "upstream page failed, skipping client");
                    index += 1;
                }
            }
        }
        (Vec::new(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unimcp_protocol::Tool;

    #[test]
    fn change_set_between_refreshes() {
        let before: BTreeSet<String> = ["a/one".to_string(), "a/two".to_string()]
            .into_iter()
            .collect();
        let after: BTreeSet<String> = ["a/two".to_string(), "a/three".to_string()]
            .into_iter()
            .collect();
        let change = CategoryChange::between(&before, &after);
        assert_eq!(change.added, vec!["a/three".to_string()]);
        assert_eq!(change.removed, vec!["a/one".to_string()]);
        assert!(change.has_changes());
    }

    #[test]
    fn registry_feeds_qualified_sets() {
        let aggregator = Aggregator::new(4);
        aggregator.registry().replace(ServerCatalog {
            server: "a".to_string(),
            connection_key: "a".to_string(),
            tags: vec!["x".to_string()],
            tools: vec![Tool::new("one", ""), Tool::new("two", "")],
            ..Default::default()
        });
        // No live connections: the view over an empty visible set is empty
        // regardless of registry contents.
        let view = aggregator.compute_view(&HashMap::new(), None);
        assert!(view.tools.is_empty());
    }

    #[test]
    fn empty_previous_means_everything_added() {
        let change = CategoryChange::between(
            &BTreeSet::new(),
            &["x/a".to_string()].into_iter().collect(),
        );
        assert_eq!(change.added.len(), 1);
        assert!(change.removed.is_empty());
        assert_eq!(change.previous.len(), 0);
    }
}
