//! Session context and the typed lookup over it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Client identity carried under `transport.client`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Transport block of the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientDescriptor>,
}

/// Environment block of the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

/// The context bag a downstream client supplies at `initialize` via
/// `params._meta.context`. Opaque free-form blocks (`project`, `user`)
/// stay as JSON; typed blocks cover the fields the engine addresses
/// directly. Never trusted for security decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextData {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub project: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user: Value,
    #[serde(default)]
    pub environment: EnvironmentContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub transport: TransportContext,
}

/// A resolver from dotted paths to string values.
///
/// Unknown paths return `None`: absent, not an error. Implementations
/// must be pure so that rendering the same `(template, context)` is
/// deterministic.
pub trait ContextLookup {
    fn lookup(&self, path: &str) -> Option<String>;
}

impl ContextLookup for ContextData {
    fn lookup(&self, path: &str) -> Option<String> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        match head {
            "project" => lookup_value(&self.project, parts),
            "user" => lookup_value(&self.user, parts),
            "environment" => match parts.next() {
                Some("variables") => {
                    let name = parts.next()?;
                    if parts.next().is_some() {
                        return None;
                    }
                    self.environment.variables.get(name).cloned()
                }
                _ => None,
            },
            "sessionId" => end(parts).and_then(|()| self.session_id.clone()),
            "timestamp" => end(parts).and_then(|()| self.timestamp.clone()),
            "version" => end(parts).and_then(|()| self.version.clone()),
            "transport" => match parts.next() {
                Some("client") => {
                    let client = self.transport.client.as_ref()?;
                    let field = parts.next()?;
                    if parts.next().is_some() {
                        return None;
                    }
                    match field {
                        "name" => client.name.clone(),
                        "version" => client.version.clone(),
                        "title" => client.title.clone(),
                        _ => None,
                    }
                }
                _ => None,
            },
            _ => None,
        }
    }
}

fn end<'a>(mut parts: impl Iterator<Item = &'a str>) -> Option<()> {
    if parts.next().is_none() { Some(()) } else { None }
}

fn lookup_value<'a>(root: &Value, parts: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut current = root;
    for part in parts {
        current = current.get(part)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        // Objects/arrays/null have no string form in a template.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContextData {
        ContextData {
            project: serde_json::json!({"name": "alpha", "environment": "dev", "depth": {"n": 3}}),
            user: serde_json::json!({"name": "sam"}),
            environment: EnvironmentContext {
                variables: [("HOME".to_string(), "/home/sam".to_string())]
                    .into_iter()
                    .collect(),
            },
            session_id: Some("unimcp-abc".to_string()),
            timestamp: Some("2026-08-01T00:00:00Z".to_string()),
            version: Some("1.0.0".to_string()),
            transport: TransportContext {
                client: Some(ClientDescriptor {
                    name: Some("editor".to_string()),
                    version: Some("2.1".to_string()),
                    title: None,
                }),
            },
        }
    }

    #[test]
    fn known_paths_resolve() {
        let ctx = sample();
        assert_eq!(ctx.lookup("project.name").as_deref(), Some("alpha"));
        assert_eq!(ctx.lookup("project.depth.n").as_deref(), Some("3"));
        assert_eq!(ctx.lookup("user.name").as_deref(), Some("sam"));
        assert_eq!(
            ctx.lookup("environment.variables.HOME").as_deref(),
            Some("/home/sam")
        );
        assert_eq!(ctx.lookup("sessionId").as_deref(), Some("unimcp-abc"));
        assert_eq!(ctx.lookup("transport.client.name").as_deref(), Some("editor"));
        assert_eq!(ctx.lookup("transport.client.version").as_deref(), Some("2.1"));
    }

    #[test]
    fn unknown_paths_are_absent() {
        let ctx = sample();
        assert_eq!(ctx.lookup("project.missing"), None);
        assert_eq!(ctx.lookup("nonsense"), None);
        assert_eq!(ctx.lookup("transport.client.title"), None);
        assert_eq!(ctx.lookup("environment.variables.PATH"), None);
        assert_eq!(ctx.lookup("sessionId.extra"), None);
        // Object-valued path has no string form.
        assert_eq!(ctx.lookup("project.depth"), None);
    }

    #[test]
    fn default_context_resolves_nothing() {
        let ctx = ContextData::default();
        assert_eq!(ctx.lookup("project.name"), None);
        assert_eq!(ctx.lookup("sessionId"), None);
    }
}
