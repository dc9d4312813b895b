//! Bounded cache of full tool input schemas.
//!
//! `tool_list` deliberately returns trimmed descriptors; the full schema is
//! fetched on demand through `tool_schema` and remembered here.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use unimcp_core::{CacheConfig, TtlLruCache};

/// Cache keyed by `(serverName, toolName)`.
#[derive(Clone)]
pub struct SchemaCache {
    cache: Arc<TtlLruCache<(String, String), Value>>,
}

impl SchemaCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(TtlLruCache::new(CacheConfig { max_entries, ttl })),
        }
    }

    pub fn get(&self, server: &str, tool: &str) -> Option<Value> {
        self.cache.get(&(server.to_string(), tool.to_string()))
    }

    pub fn insert(&self, server: &str, tool: &str, schema: Value) {
        self.cache
            .insert((server.to_string(), tool.to_string()), schema);
    }

    /// Drop every schema for one server (after restart or removal).
    pub fn invalidate_server(&self, server: &str) {
        self.cache.retain(|(owner, _)| owner != server);
    }

    pub fn inner(&self) -> &Arc<TtlLruCache<(String, String), Value>> {
        &self.cache
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(512, Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert() {
        let cache = SchemaCache::default();
        let schema = serde_json::json!({"type": "object", "properties": {"x": {"type": "string"}}});
        cache.insert("fs", "read_file", schema.clone());
        assert_eq!(cache.get("fs", "read_file"), Some(schema));
        assert_eq!(cache.get("fs", "other"), None);
    }

    #[test]
    fn invalidation_is_per_server() {
        let cache = SchemaCache::default();
        cache.insert("fs", "read_file", serde_json::json!({}));
        cache.insert("web", "fetch", serde_json::json!({}));
        cache.invalidate_server("fs");
        assert_eq!(cache.get("fs", "read_file"), None);
        assert!(cache.get("web", "fetch").is_some());
    }
}
