//! Per-session MCP request dispatch.
//!
//! Every inbound transport funnels JSON-RPC frames here. Handlers consult
//! the aggregator for list surfaces and the connection resolver for calls;
//! errors become JSON-RPC errors at this boundary and nowhere deeper.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use unimcp_protocol::jsonrpc::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use unimcp_protocol::types::methods;
use unimcp_protocol::{
    CallToolParams, Implementation, InitializeResult, LoggingLevel, PROTOCOL_VERSION,
    ServerCapabilities,
};
use unimcp_registry::{Category, MetaToolHandler};
use unimcp_registry::meta::{META_TOOL_INVOKE, META_TOOL_LIST, META_TOOL_SCHEMA};
use unimcp_template::ContextData;

use crate::error::{ProxyError, ProxyResult};
use crate::runtime::Runtime;
use crate::session::InboundSession;

/// Handle one inbound frame; `None` for notifications (no response).
pub async fn handle_message(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    message: JsonRpcMessage,
) -> Option<JsonRpcResponse> {
    match message {
        JsonRpcMessage::Request(request) => Some(handle_request(runtime, session, request).await),
        JsonRpcMessage::Notification(note) => {
            debug!(session = %session.id, method = %note.method, "inbound notification");
            None
        }
        JsonRpcMessage::Response(_) => None,
    }
}

/// Handle one request, always producing a response.
pub async fn handle_request(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    session.touch();
    let id = request.id.clone();
    let params = request.params.unwrap_or(Value::Null);
    let result = match request.method.as_str() {
        methods::INITIALIZE => initialize(runtime, session, params).await,
        methods::PING => Ok(json!({})),
        methods::TOOLS_LIST => list_tools(runtime, session, &params).await,
        methods::TOOLS_CALL => call_tool(runtime, session, params).await,
        methods::RESOURCES_LIST => list_category(runtime, session, &params, Category::Resources).await,
        methods::RESOURCES_TEMPLATES_LIST => {
            list_category(runtime, session, &params, Category::ResourceTemplates).await
        }
        methods::RESOURCES_READ => read_resource(runtime, session, params).await,
        methods::PROMPTS_LIST => list_category(runtime, session, &params, Category::Prompts).await,
        methods::PROMPTS_GET => get_prompt(runtime, session, params).await,
        methods::LOGGING_SET_LEVEL => set_level(session, params),
        other => {
            return JsonRpcResponse::error(
                id,
                unimcp_protocol::JsonRpcError::method_not_found(other),
            );
        }
    };
    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, e.to_jsonrpc()),
    }
}

async fn initialize(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    params: Value,
) -> ProxyResult<Value> {
    let context: ContextData = params
        .get("_meta")
        .and_then(|m| m.get("context"))
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .unwrap_or_else(|e| {
            debug!(error = %e, "malformed _meta.context, using empty context");
            None
        })
        .unwrap_or_default();
    session.set_context(context);
    session.mark_initialized();
    session.set_status(crate::session::SessionStatus::Connected);
    runtime.sessions.update_persisted(session).await;

    // Materialize templates for this session; upstream connects proceed in
    // the background.
    let snapshot = runtime.snapshot.load_full();
    runtime.factory.attach_session(session, &snapshot).await?;

    // Baseline the view so later fan-outs diff against what this session
    // could see at handshake time.
    let visible = runtime.resolver.filter_for_session(&session.id);
    let baseline = runtime
        .aggregator
        .compute_view(&visible, session.filter.expression.as_ref())
        .qualified();
    session.replace_view_baseline(baseline);

    let instructions = instructions_digest(runtime, session);
    let result = InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities::aggregate(),
        server_info: Implementation {
            name: runtime.advertised_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("unimcp aggregating proxy".to_string()),
        },
        instructions,
    };
    Ok(serde_json::to_value(result)?)
}

/// Labelled digest of upstream-provided instructions visible to a session.
fn instructions_digest(runtime: &Arc<Runtime>, session: &Arc<InboundSession>) -> Option<String> {
    let visible = runtime.resolver.filter_for_session(&session.id);
    let mut sections: Vec<(String, String)> = runtime
        .aggregator
        .filter_visible(&visible, session.filter.expression.as_ref())
        .into_iter()
        .filter_map(|(key, connection)| {
            connection
                .instructions()
                .map(|text| (key.name().to_string(), text))
        })
        .collect();
    sections.sort();
    sections.dedup();
    if sections.is_empty() {
        return None;
    }
    Some(
        sections
            .into_iter()
            .map(|(name, text)| format!("## {name}\n\n{text}"))
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}

async fn list_tools(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    params: &Value,
) -> ProxyResult<Value> {
    // Lazy loading replaces the aggregated surface with the façade.
    if runtime.snapshot.load().features.lazy_loading {
        let tools = MetaToolHandler::definitions();
        return Ok(json!({ "tools": tools }));
    }

    let cursor = params.get("cursor").and_then(Value::as_str);
    let visible = runtime.resolver.filter_for_session(&session.id);
    let expr = session.filter.expression.as_ref();
    if session.enable_pagination {
        let (tools, next_cursor) = runtime
            .aggregator
            .list_paged(&visible, expr, Category::Tools, cursor)
            .await;
        let mut out = json!({ "tools": tools });
        if let Some(next) = next_cursor {
            out["nextCursor"] = Value::String(next);
        }
        Ok(out)
    } else {
        let tools = runtime
            .aggregator
            .list_merged(&visible, expr, Category::Tools)
            .await;
        Ok(json!({ "tools": tools }))
    }
}

async fn list_category(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    params: &Value,
    category: Category,
) -> ProxyResult<Value> {
    let field = match category {
        Category::Tools => "tools",
        Category::Resources => "resources",
        Category::ResourceTemplates => "resourceTemplates",
        Category::Prompts => "prompts",
    };
    let cursor = params.get("cursor").and_then(Value::as_str);
    let visible = runtime.resolver.filter_for_session(&session.id);
    let expr = session.filter.expression.as_ref();
    if session.enable_pagination {
        let (items, next_cursor) = runtime
            .aggregator
            .list_paged(&visible, expr, category, cursor)
            .await;
        let mut out = json!({ field: items });
        if let Some(next) = next_cursor {
            out["nextCursor"] = Value::String(next);
        }
        Ok(out)
    } else {
        let items = runtime
            .aggregator
            .list_merged(&visible, expr, category)
            .await;
        Ok(json!({ field: items }))
    }
}

async fn call_tool(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    params: Value,
) -> ProxyResult<Value> {
    let call: CallToolParams = serde_json::from_value(params)
        .map_err(|e| ProxyError::invalid_params(format!("tools/call params: {e}")))?;

    let visible = runtime.resolver.filter_for_session(&session.id);
    let expr = session.filter.expression.as_ref();

    if matches!(
        call.name.as_str(),
        META_TOOL_LIST | META_TOOL_SCHEMA | META_TOOL_INVOKE
    ) && runtime.snapshot.load().features.lazy_loading
    {
        let args = call
            .arguments
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .unwrap_or(json!({}));
        let result =
            MetaToolHandler::handle(&runtime.aggregator, &visible, expr, &call.name, &args).await;
        let is_error = result.get("error").is_some();
        return Ok(json!({
            "content": [{ "type": "text", "text": result.to_string() }],
            "structuredContent": result,
            "isError": is_error,
        }));
    }

    // Resolve the owning server for an unqualified tool name: first match
    // across the session's visible, filtered catalogs in lexical order.
    let candidates = runtime.aggregator.filter_visible(&visible, expr);
    let mut owner = None;
    for (key, connection) in &candidates {
        if let Some(catalog) = runtime.aggregator.registry().get(&key.to_string()) {
            if catalog.tools.iter().any(|t| t.name == call.name) {
                owner = Some((key.clone(), Arc::clone(connection)));
                break;
            }
        }
    }
    let (key, connection) = owner.ok_or_else(|| {
        ProxyError::Outbound(unimcp_outbound::OutboundError::ClientNotFound(format!(
            "no visible server exposes tool {:?}",
            call.name
        )))
    })?;
    debug!(session = %session.id, tool = %call.name, server = %key, "dispatching tool call");

    let client = connection.client().ok_or_else(|| {
        ProxyError::Outbound(unimcp_outbound::OutboundError::connection(format!(
            "{key}: not connected"
        )))
    })?;
    let result = client.call_tool(&call.name, call.arguments).await?;
    Ok(result)
}

async fn read_resource(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    params: Value,
) -> ProxyResult<Value> {
    let uri = params
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::invalid_params("uri is required"))?;

    let visible = runtime.resolver.filter_for_session(&session.id);
    let expr = session.filter.expression.as_ref();
    for (key, connection) in runtime.aggregator.filter_visible(&visible, expr) {
        let Some(catalog) = runtime.aggregator.registry().get(&key.to_string()) else {
            continue;
        };
        if catalog.resources.iter().any(|r| r.uri == uri) {
            let client = connection.client().ok_or_else(|| {
                ProxyError::Outbound(unimcp_outbound::OutboundError::connection(format!(
                    "{key}: not connected"
                )))
            })?;
            return Ok(client.read_resource(uri).await?);
        }
    }
    Err(ProxyError::Outbound(
        unimcp_outbound::OutboundError::ClientNotFound(format!(
            "no visible server exposes resource {uri:?}"
        )),
    ))
}

async fn get_prompt(
    runtime: &Arc<Runtime>,
    session: &Arc<InboundSession>,
    params: Value,
) -> ProxyResult<Value> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::invalid_params("name is required"))?
        .to_string();
    let arguments: Option<HashMap<String, Value>> = params
        .get("arguments")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ProxyError::invalid_params(format!("arguments: {e}")))?;

    let visible = runtime.resolver.filter_for_session(&session.id);
    let expr = session.filter.expression.as_ref();
    for (key, connection) in runtime.aggregator.filter_visible(&visible, expr) {
        let Some(catalog) = runtime.aggregator.registry().get(&key.to_string()) else {
            continue;
        };
        if catalog.prompts.iter().any(|p| p.name == name) {
            let client = connection.client().ok_or_else(|| {
                ProxyError::Outbound(unimcp_outbound::OutboundError::connection(format!(
                    "{key}: not connected"
                )))
            })?;
            return Ok(client.get_prompt(&name, arguments).await?);
        }
    }
    Err(ProxyError::Outbound(
        unimcp_outbound::OutboundError::ClientNotFound(format!(
            "no visible server exposes prompt {name:?}"
        )),
    ))
}

fn set_level(session: &Arc<InboundSession>, params: Value) -> ProxyResult<Value> {
    let level: LoggingLevel = params
        .get("level")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ProxyError::invalid_params(format!("level: {e}")))?
        .ok_or_else(|| ProxyError::invalid_params("level is required"))?;
    session.set_log_level(level);
    Ok(json!({}))
}
