//! The meta-tool façade.
//!
//! With `lazyLoading` enabled, sessions see three pseudo-tools instead of
//! the full upstream surface: `tool_list` (browse), `tool_schema` (inspect
//! one schema), `tool_invoke` (dispatch). Errors are tagged objects of
//! the form `{error: {type: validation|not_found|upstream, message}}`,
//! exposed verbatim to the caller.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use unimcp_outbound::{ConnectionKey, ConnectionStatus, OutboundConnection};
use unimcp_protocol::Tool;
use unimcp_tags::TagExpression;

use crate::aggregator::Aggregator;
use crate::cursor::{decode_cursor, encode_cursor};

pub const META_TOOL_LIST: &str = "tool_list";
pub const META_TOOL_SCHEMA: &str = "tool_schema";
pub const META_TOOL_INVOKE: &str = "tool_invoke";

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

fn error_value(kind: &str, message: impl Into<String>) -> Value {
    json!({ "error": { "type": kind, "message": message.into() } })
}

/// Stateless handler for the three pseudo-tools.
pub struct MetaToolHandler;

impl MetaToolHandler {
    /// The pseudo-tool definitions injected into a session's tool list.
    pub fn definitions() -> Vec<Tool> {
        vec![
            Tool::new(
                META_TOOL_LIST,
                "List available tools across connected servers, with optional server and glob-pattern filters",
            )
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "server": { "type": "string", "description": "Only list tools from this server" },
                    "pattern": { "type": "string", "description": "Glob over tool names; * matches any run" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": MAX_PAGE },
                    "cursor": { "type": "string" }
                }
            })),
            Tool::new(
                META_TOOL_SCHEMA,
                "Fetch the full input schema of one tool",
            )
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "server": { "type": "string" },
                    "toolName": { "type": "string" }
                },
                "required": ["server", "toolName"]
            })),
            Tool::new(META_TOOL_INVOKE, "Invoke a tool on a connected server")
                .with_input_schema(json!({
                    "type": "object",
                    "properties": {
                        "server": { "type": "string" },
                        "toolName": { "type": "string" },
                        "args": { "type": "object" }
                    },
                    "required": ["server", "toolName"]
                })),
        ]
    }

    /// Dispatch one meta-tool call. Returns the result object, or a tagged
    /// error object; never an Err.
    pub async fn handle(
        aggregator: &Aggregator,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
        tool: &str,
        args: &Value,
    ) -> Value {
        match tool {
            META_TOOL_LIST => Self::tool_list(aggregator, visible, expr, args),
            META_TOOL_SCHEMA => Self::tool_schema(aggregator, visible, expr, args).await,
            META_TOOL_INVOKE => Self::tool_invoke(aggregator, visible, expr, args).await,
            other => error_value("not_found", format!("unknown meta tool {other:?}")),
        }
    }

    fn tool_list(
        aggregator: &Aggregator,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
        args: &Value,
    ) -> Value {
        let server = args.get("server").and_then(Value::as_str);
        let pattern = args.get("pattern").and_then(Value::as_str);
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_PAGE, |l| (l as usize).clamp(1, MAX_PAGE));

        let view = aggregator.compute_view(visible, expr);
        let mut entries: Vec<(String, Tool)> = view
            .tools
            .into_iter()
            .filter(|(s, _)| server.is_none_or(|wanted| s == wanted))
            .filter(|(_, t)| pattern.is_none_or(|p| crate::registry::glob_match(p, &t.name)))
            .collect();
        entries.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        entries.dedup_by(|a, b| a.0 == b.0 && a.1.name == b.1.name);

        // Resume after the cursor position, if one was given and decodes.
        let start = match args.get("cursor").and_then(Value::as_str) {
            None | Some("") => 0,
            Some(raw) => match decode_cursor(raw) {
                Some(cursor) => {
                    let after = (cursor.client, cursor.upstream.unwrap_or_default());
                    entries
                        .iter()
                        .position(|(s, t)| (s.as_str(), t.name.as_str()) > (after.0.as_str(), after.1.as_str()))
                        .unwrap_or(entries.len())
                }
                None => {
                    warn!(cursor = %raw, "invalid tool_list cursor, returning first page");
                    0
                }
            },
        };

        let page: Vec<&(String, Tool)> = entries.iter().skip(start).take(limit).collect();
        let next_cursor = if start + page.len() < entries.len() {
            page.last()
                .map(|(s, t)| encode_cursor(s, Some(&t.name)))
        } else {
            None
        };

        let tools: Vec<Value> = page
            .into_iter()
            .map(|(server, tool)| {
                json!({
                    "server": server,
                    "name": tool.name,
                    "description": short_description(tool),
                })
            })
            .collect();

        let mut out = json!({ "tools": tools });
        if let Some(next) = next_cursor {
            out["nextCursor"] = Value::String(next);
        }
        out
    }

    async fn tool_schema(
        aggregator: &Aggregator,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
        args: &Value,
    ) -> Value {
        let (server, tool_name) = match required_pair(args) {
            Ok(pair) => pair,
            Err(message) => return error_value("validation", message),
        };

        // The session's filter bounds what it may inspect.
        let Some(connection) = find_visible(aggregator, visible, expr, server) else {
            return error_value("not_found", format!("server {server:?} not available"));
        };

        if let Some(schema) = aggregator.schema_cache().get(server, tool_name) {
            return json!({ "server": server, "toolName": tool_name, "schema": schema });
        }

        // Miss: ask the upstream once and backfill.
        let Some(client) = connection.client() else {
            return error_value("not_found", format!("server {server:?} not connected"));
        };
        let mut cursor = None;
        loop {
            let page = match client.list_tools(cursor.take()).await {
                Ok(page) => page,
                Err(e) => return error_value("upstream", e.to_string()),
            };
            for tool in &page.tools {
                aggregator
                    .schema_cache()
                    .insert(server, &tool.name, tool.input_schema.clone());
            }
            if let Some(tool) = page.tools.iter().find(|t| t.name == tool_name) {
                return json!({
                    "server": server,
                    "toolName": tool_name,
                    "schema": tool.input_schema
                });
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        error_value(
            "not_found",
            format!("tool {tool_name:?} not found on {server:?}"),
        )
    }

    async fn tool_invoke(
        aggregator: &Aggregator,
        visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
        expr: Option<&TagExpression>,
        args: &Value,
    ) -> Value {
        let (server, tool_name) = match required_pair(args) {
            Ok(pair) => pair,
            Err(message) => return error_value("validation", message),
        };
        let call_args = match args.get("args") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<String, Value>>(),
            ),
            Some(_) => return error_value("validation", "args must be an object"),
        };

        let Some(connection) = find_visible(aggregator, visible, expr, server) else {
            return error_value("not_found", format!("server {server:?} not available"));
        };
        let Some(client) = connection.client() else {
            return error_value("not_found", format!("server {server:?} not connected"));
        };

        match client.call_tool(tool_name, call_args).await {
            Ok(result) => result,
            Err(e) => error_value("upstream", e.to_string()),
        }
    }
}

fn required_pair(args: &Value) -> Result<(&str, &str), String> {
    let server = args
        .get("server")
        .and_then(Value::as_str)
        .ok_or("server is required")?;
    let tool_name = args
        .get("toolName")
        .and_then(Value::as_str)
        .ok_or("toolName is required")?;
    Ok((server, tool_name))
}

/// The session's view of one server: connected and tag-visible.
fn find_visible(
    aggregator: &Aggregator,
    visible: &HashMap<ConnectionKey, Arc<OutboundConnection>>,
    expr: Option<&TagExpression>,
    server: &str,
) -> Option<Arc<OutboundConnection>> {
    visible
        .iter()
        .filter(|(key, c)| key.name() == server && c.status() == ConnectionStatus::Connected)
        .find(|(_, c)| match expr {
            Some(expr) => aggregator.filter_cache().matches(expr, &c.tags()),
            None => true,
        })
        .map(|(_, c)| Arc::clone(c))
}

fn short_description(tool: &Tool) -> String {
    let description = tool.description.clone().unwrap_or_default();
    let mut short: String = description.chars().take(120).collect();
    if short.len() < description.len() {
        short.push('…');
    }
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_are_well_formed() {
        let defs = MetaToolHandler::definitions();
        assert_eq!(defs.len(), 3);
        let names: Vec<&str> = defs.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![META_TOOL_LIST, META_TOOL_SCHEMA, META_TOOL_INVOKE]);
        for def in &defs {
            assert_eq!(def.input_schema["type"], "object");
        }
    }

    #[test]
    fn validation_errors_are_tagged() {
        let err = error_value("validation", "server is required");
        assert_eq!(err["error"]["type"], "validation");
        assert_eq!(err["error"]["message"], "server is required");
    }

    #[tokio::test]
    async fn unknown_meta_tool_is_not_found() {
        let aggregator = Aggregator::new(2);
        let result = MetaToolHandler::handle(
            &aggregator,
            &HashMap::new(),
            None,
            "tool_bogus",
            &json!({}),
        )
        .await;
        assert_eq!(result["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn invoke_without_server_is_validation_error() {
        let aggregator = Aggregator::new(2);
        let result = MetaToolHandler::handle(
            &aggregator,
            &HashMap::new(),
            None,
            META_TOOL_INVOKE,
            &json!({"toolName": "x"}),
        )
        .await;
        assert_eq!(result["error"]["type"], "validation");
    }

    #[tokio::test]
    async fn invoke_unknown_server_is_not_found() {
        let aggregator = Aggregator::new(2);
        let result = MetaToolHandler::handle(
            &aggregator,
            &HashMap::new(),
            None,
            META_TOOL_INVOKE,
            &json!({"server": "ghost", "toolName": "x"}),
        )
        .await;
        assert_eq!(result["error"]["type"], "not_found");
    }

    #[test]
    fn short_descriptions_are_truncated() {
        let tool = Tool::new("t", "x".repeat(500));
        let short = short_description(&tool);
        assert!(short.chars().count() <= 121);
        assert!(short.ends_with('…'));
    }
}
