//! Snapshot loading and validation.

use std::path::Path;

use crate::error::ConfigError;
use crate::types::{ConfigSnapshot, McpServerParams, TransportKind};

/// Read and validate a snapshot from `path`.
pub fn load_snapshot(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    parse_snapshot(&raw)
}

/// Parse and validate a snapshot from raw JSON text.
pub fn parse_snapshot(raw: &str) -> Result<ConfigSnapshot, ConfigError> {
    let snapshot: ConfigSnapshot =
        serde_json::from_str(raw).map_err(|e| ConfigError::parse(e.to_string()))?;
    validate(&snapshot)?;
    Ok(snapshot)
}

fn validate(snapshot: &ConfigSnapshot) -> Result<(), ConfigError> {
    // Static and template namespaces are disjoint.
    for name in snapshot.mcp_servers.keys() {
        if snapshot.mcp_templates.contains_key(name) {
            return Err(ConfigError::conflict(format!(
                "{name:?} appears in both mcpServers and mcpTemplates"
            )));
        }
    }

    for (name, params) in &snapshot.mcp_servers {
        validate_params(name, params, false)?;
    }
    for (name, params) in &snapshot.mcp_templates {
        validate_params(name, params, true)?;
    }
    Ok(())
}

fn validate_params(
    name: &str,
    params: &McpServerParams,
    is_template: bool,
) -> Result<(), ConfigError> {
    if name.contains(':') {
        return Err(ConfigError::conflict(format!(
            "server name {name:?} must not contain ':'"
        )));
    }

    let has_stdio = params.command.is_some();
    let has_network = params.url.is_some();
    if has_stdio == has_network {
        return Err(ConfigError::conflict(format!(
            "{name:?}: exactly one of command (stdio) or url (network) must be set"
        )));
    }

    if let Some(kind) = params.kind {
        if kind.is_stdio() != has_stdio {
            return Err(ConfigError::conflict(format!(
                "{name:?}: transport type {kind:?} does not match the configured fields"
            )));
        }
    }

    if !is_template && params.template.is_some() {
        return Err(ConfigError::conflict(format!(
            "{name:?}: template block is only valid under mcpTemplates"
        )));
    }

    // Interpolation markers are a template-only feature.
    if !is_template && params_has_placeholder(params) {
        return Err(ConfigError::conflict(format!(
            "{name:?}: {{{{…}}}} interpolation is only valid under mcpTemplates"
        )));
    }

    for tag in &params.tags {
        let ok = !tag.is_empty()
            && tag.len() <= 64
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !ok {
            return Err(ConfigError::conflict(format!(
                "{name:?}: invalid tag {tag:?}"
            )));
        }
    }

    if params.transport() == TransportKind::Sse || params.transport().is_network() {
        if let Some(url) = &params.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::conflict(format!(
                    "{name:?}: url must be http(s), got {url:?}"
                )));
            }
        }
    }

    Ok(())
}

fn params_has_placeholder(params: &McpServerParams) -> bool {
    let has = |s: &str| s.contains("{{");
    params.command.as_deref().is_some_and(has)
        || params.args.iter().any(|a| has(a))
        || params.env.values().any(|v| has(v))
        || params.cwd.as_deref().is_some_and(has)
        || params.url.as_deref().is_some_and(has)
        || params.headers.values().any(|v| has(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let snapshot = parse_snapshot(
            r#"{
                "version": "1.0.0",
                "mcpServers": {
                    "fs": {"command": "mcp-fs", "args": ["--root", "/"], "tags": ["filesystem"]}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(snapshot.mcp_servers.len(), 1);
        let fs = &snapshot.mcp_servers["fs"];
        assert_eq!(fs.transport(), TransportKind::Stdio);
        assert_eq!(snapshot.available_tags(), vec!["filesystem".to_string()]);
    }

    #[test]
    fn name_collision_rejected() {
        let err = parse_snapshot(
            r#"{
                "mcpServers": {"x": {"command": "a"}},
                "mcpTemplates": {"x": {"command": "b", "template": {"perClient": true}}}
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }

    #[test]
    fn stdio_and_url_both_set_rejected() {
        let err = parse_snapshot(
            r#"{"mcpServers": {"x": {"command": "a", "url": "http://localhost"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));

        let err = parse_snapshot(r#"{"mcpServers": {"x": {}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }

    #[test]
    fn placeholders_forbidden_in_static_section() {
        let err = parse_snapshot(
            r#"{"mcpServers": {"x": {"command": "run", "args": ["{{project.name}}"]}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));

        // But fine under mcpTemplates.
        let snapshot = parse_snapshot(
            r#"{"mcpTemplates": {"x": {"command": "run", "args": ["{{project.name}}"]}}}"#,
        )
        .unwrap();
        assert_eq!(snapshot.mcp_templates.len(), 1);
    }

    #[test]
    fn template_block_forbidden_in_static_section() {
        let err = parse_snapshot(
            r#"{"mcpServers": {"x": {"command": "a", "template": {"shareable": true}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }

    #[test]
    fn colon_in_name_rejected() {
        let err = parse_snapshot(r#"{"mcpServers": {"a:b": {"command": "x"}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }

    #[test]
    fn invalid_tag_rejected() {
        let err = parse_snapshot(
            r#"{"mcpServers": {"x": {"command": "a", "tags": ["bad tag"]}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_snapshot("{nope").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
