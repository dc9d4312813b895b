//! Structural diff between configuration snapshots.
//!
//! The selective-reload engine acts on the minimal change set: entries only
//! in the old snapshot stop, entries only in the new one start, entries in
//! both with different params restart. Equality is structural over the
//! serialized form, so field order in the source document is irrelevant.

use std::collections::BTreeMap;

use crate::types::{ConfigSnapshot, McpServerParams};

/// Changes within one config section (servers or templates).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionDiff {
    pub to_stop: Vec<String>,
    pub to_start: Vec<String>,
    pub to_restart: Vec<String>,
}

impl SectionDiff {
    /// True when the section is untouched.
    pub fn is_empty(&self) -> bool {
        self.to_stop.is_empty() && self.to_start.is_empty() && self.to_restart.is_empty()
    }
}

/// The full diff the reload engine executes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers: SectionDiff,
    pub templates: SectionDiff,
}

impl ConfigDiff {
    /// True when nothing changed; `reload(snapshot, snapshot)` must land here.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.templates.is_empty()
    }

    /// True when the diff touches the template section at all.
    pub fn touches_templates(&self) -> bool {
        !self.templates.is_empty()
    }
}

/// Compute the diff between two snapshots.
///
/// Disabled entries count as absent: disabling a server diffs as a stop,
/// enabling one as a start.
pub fn diff_snapshots(old: &ConfigSnapshot, new: &ConfigSnapshot) -> ConfigDiff {
    ConfigDiff {
        servers: diff_section(&old.mcp_servers, &new.mcp_servers),
        templates: diff_section(&old.mcp_templates, &new.mcp_templates),
    }
}

fn diff_section(
    old: &BTreeMap<String, McpServerParams>,
    new: &BTreeMap<String, McpServerParams>,
) -> SectionDiff {
    let mut diff = SectionDiff::default();

    let enabled = |map: &BTreeMap<String, McpServerParams>, name: &str| {
        map.get(name).filter(|p| !p.disabled).cloned()
    };

    for name in old.keys() {
        let before = enabled(old, name);
        let after = enabled(new, name);
        match (before, after) {
            (Some(_), None) => diff.to_stop.push(name.clone()),
            (Some(b), Some(a)) if !params_equal(&b, &a) => diff.to_restart.push(name.clone()),
            _ => {}
        }
    }
    for name in new.keys() {
        if enabled(new, name).is_some() && enabled(old, name).is_none() {
            diff.to_start.push(name.clone());
        }
    }
    diff
}

fn params_equal(a: &McpServerParams, b: &McpServerParams) -> bool {
    // Serialize through Value: BTreeMap-backed fields make this
    // insensitive to source field order.
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_snapshot;
    use pretty_assertions::assert_eq;

    fn snapshot(raw: &str) -> ConfigSnapshot {
        parse_snapshot(raw).unwrap()
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let a = snapshot(r#"{"mcpServers": {"a": {"command": "x", "args": ["--port=1"]}}}"#);
        let b = snapshot(r#"{"mcpServers": {"a": {"args": ["--port=1"], "command": "x"}}}"#);
        assert!(diff_snapshots(&a, &b).is_empty());
    }

    #[test]
    fn restart_and_start_detected() {
        let old = snapshot(r#"{"mcpServers": {"a": {"command": "x", "args": ["--port=1"]}}}"#);
        let new = snapshot(
            r#"{"mcpServers": {
                "a": {"command": "x", "args": ["--port=2"]},
                "c": {"command": "y"}
            }}"#,
        );
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.servers.to_restart, vec!["a".to_string()]);
        assert_eq!(diff.servers.to_start, vec!["c".to_string()]);
        assert!(diff.servers.to_stop.is_empty());
    }

    #[test]
    fn removal_detected() {
        let old = snapshot(r#"{"mcpServers": {"a": {"command": "x"}, "b": {"command": "y"}}}"#);
        let new = snapshot(r#"{"mcpServers": {"a": {"command": "x"}}}"#);
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.servers.to_stop, vec!["b".to_string()]);
    }

    #[test]
    fn disabling_counts_as_stop() {
        let old = snapshot(r#"{"mcpServers": {"a": {"command": "x"}}}"#);
        let new = snapshot(r#"{"mcpServers": {"a": {"command": "x", "disabled": true}}}"#);
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.servers.to_stop, vec!["a".to_string()]);
        assert!(diff.servers.to_restart.is_empty());

        // And back again is a start.
        let diff = diff_snapshots(&new, &old);
        assert_eq!(diff.servers.to_start, vec!["a".to_string()]);
    }

    #[test]
    fn template_changes_isolated_from_servers() {
        let old = snapshot(
            r#"{"mcpTemplates": {"w": {"command": "x", "args": ["{{project.name}}"]}}}"#,
        );
        let new = snapshot(
            r#"{"mcpTemplates": {"w": {"command": "x", "args": ["{{user.name}}"]}}}"#,
        );
        let diff = diff_snapshots(&old, &new);
        assert!(diff.servers.is_empty());
        assert_eq!(diff.templates.to_restart, vec!["w".to_string()]);
        assert!(diff.touches_templates());
    }
}
