//! The tool registry: an indexed cache of upstream capabilities.
//!
//! Keyed by connection key (one catalog per live upstream instance), since
//! two rendered instances of one template can expose different tool sets.
//! Views map entries back to the logical server name.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use unimcp_protocol::{Prompt, Resource, ResourceTemplate, Tool};

/// Everything one upstream instance reported.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    /// Logical server name (connection key minus instance suffix).
    pub server: String,
    /// Connection key string this catalog was fetched through.
    pub connection_key: String,
    /// Tags inherited from the server's config entry.
    pub tags: Vec<String>,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    pub instructions: Option<String>,
}

/// Shared registry of catalogs, with by-server and by-pattern lookups.
#[derive(Default)]
pub struct ToolRegistry {
    catalogs: DashMap<String, Arc<ServerCatalog>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the catalog for a connection key.
    pub fn replace(&self, catalog: ServerCatalog) {
        self.catalogs
            .insert(catalog.connection_key.clone(), Arc::new(catalog));
    }

    /// Drop the catalog for a connection key. Idempotent.
    pub fn remove(&self, connection_key: &str) {
        self.catalogs.remove(connection_key);
    }

    /// Catalog for one connection key.
    pub fn get(&self, connection_key: &str) -> Option<Arc<ServerCatalog>> {
        self.catalogs
            .get(connection_key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All catalogs, ordered by connection key for stable iteration.
    pub fn snapshot(&self) -> BTreeMap<String, Arc<ServerCatalog>> {
        self.catalogs
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Find one tool by logical server name and tool name, searching every
    /// instance of that server.
    pub fn find_tool(&self, server: &str, tool_name: &str) -> Option<(Arc<ServerCatalog>, Tool)> {
        for entry in &self.catalogs {
            let catalog = entry.value();
            if catalog.server == server {
                if let Some(tool) = catalog.tools.iter().find(|t| t.name == tool_name) {
                    return Some((Arc::clone(catalog), tool.clone()));
                }
            }
        }
        None
    }

    /// Tools matching an optional server filter and glob pattern, in
    /// (server, tool) order.
    pub fn match_tools(&self, server: Option<&str>, pattern: Option<&str>) -> Vec<(String, Tool)> {
        let mut out: Vec<(String, Tool)> = Vec::new();
        for (_, catalog) in self.snapshot() {
            if let Some(wanted) = server {
                if catalog.server != wanted {
                    continue;
                }
            }
            for tool in &catalog.tools {
                if pattern.is_none_or(|p| glob_match(p, &tool.name)) {
                    out.push((catalog.server.clone(), tool.clone()));
                }
            }
        }
        out.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        out.dedup_by(|a, b| a.0 == b.0 && a.1.name == b.1.name);
        out
    }
}

/// Glob over tool names: `*` matches any run of characters, everything
/// else is literal.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some((b'*', rest)) => {
                (0..=name.len()).any(|skip| inner(rest, &name[skip..]))
            }
            Some((c, rest)) => name.split_first().is_some_and(|(n, ns)| n == c && inner(rest, ns)),
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tool(name: &str) -> Tool {
        Tool::new(name, format!("{name} does things"))
    }

    fn catalog(server: &str, key: &str, tools: &[&str]) -> ServerCatalog {
        ServerCatalog {
            server: server.to_string(),
            connection_key: key.to_string(),
            tags: vec![server.to_string()],
            tools: tools.iter().map(|t| tool(t)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn glob_semantics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("read_*", "read_file"));
        assert!(glob_match("*_file", "read_file"));
        assert!(glob_match("r*e", "read_file"));
        assert!(glob_match("read_file", "read_file"));
        assert!(!glob_match("write_*", "read_file"));
        assert!(!glob_match("read", "read_file"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn replace_and_find() {
        let registry = ToolRegistry::new();
        registry.replace(catalog("fs", "fs", &["read_file", "write_file"]));
        registry.replace(catalog("web", "web", &["fetch"]));

        let (found, t) = registry.find_tool("fs", "read_file").unwrap();
        assert_eq!(found.server, "fs");
        assert_eq!(t.name, "read_file");
        assert!(registry.find_tool("fs", "fetch").is_none());
        assert!(registry.find_tool("ghost", "x").is_none());
    }

    #[test]
    fn match_tools_filters_and_sorts() {
        let registry = ToolRegistry::new();
        registry.replace(catalog("b", "b", &["beta", "alpha"]));
        registry.replace(catalog("a", "a", &["zeta"]));

        let all = registry.match_tools(None, None);
        let names: Vec<String> = all.iter().map(|(s, t)| format!("{s}/{}", t.name)).collect();
        assert_eq!(names, vec!["a/zeta", "b/alpha", "b/beta"]);

        let only_b = registry.match_tools(Some("b"), Some("a*"));
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].1.name, "alpha");
    }

    #[test]
    fn per_instance_catalogs_keep_logical_name() {
        let registry = ToolRegistry::new();
        registry.replace(catalog("worker", "worker:unimcp-aaa", &["run"]));
        registry.replace(catalog("worker", "worker:unimcp-bbb", &["run", "stop"]));

        // Both instances are found under the logical name.
        assert!(registry.find_tool("worker", "stop").is_some());
        // Dedup collapses identical (server, tool) pairs across instances.
        let tools = registry.match_tools(Some("worker"), None);
        assert_eq!(tools.len(), 2);
    }
}
