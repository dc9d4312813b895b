//! Cross-component tests over a bootstrapped runtime.
//!
//! These run against an empty or template-only fleet so no real upstream
//! processes are needed; upstream datapath behavior is covered by the
//! client and manager unit tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use tower::ServiceExt as _;

use unimcp_protocol::jsonrpc::{JsonRpcMessage, JsonRpcRequest};
use unimcp_server::{Runtime, RuntimeOptions};

async fn runtime_with(config: serde_json::Value) -> (Arc<Runtime>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    std::fs::write(&path, config.to_string()).unwrap();
    let runtime = Runtime::bootstrap(RuntimeOptions::new(&path)).await.unwrap();
    (runtime, dir)
}

async fn open_session(runtime: &Arc<Runtime>) -> Arc<unimcp_server::InboundSession> {
    runtime
        .sessions
        .open_session(unimcp_server::session::SessionOptions {
            transport: unimcp_server::InboundTransport::StreamableHttp,
            filter: unimcp_server::SessionFilter::none(),
            enable_pagination: false,
            context: unimcp_template::ContextData::default(),
            fixed_id: None,
        })
        .await
}

fn request(method: &str, params: serde_json::Value) -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest::new(1, method, Some(params)))
}

#[tokio::test]
async fn zero_upstreams_yield_empty_views() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let session = open_session(&runtime).await;

    let response = unimcp_server::dispatch::handle_message(
        &runtime,
        &session,
        request("tools/list", serde_json::json!({})),
    )
    .await
    .expect("requests always get responses");
    assert!(!response.is_error());
    let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
    assert_eq!(tools, 0);
}

#[tokio::test]
async fn initialize_reports_proxy_identity() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let session = open_session(&runtime).await;

    let response = unimcp_server::dispatch::handle_message(
        &runtime,
        &session,
        request(
            "initialize",
            serde_json::json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "editor", "version": "1.0"},
                "_meta": {"context": {"project": {"name": "alpha"}}}
            }),
        ),
    )
    .await
    .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "unimcp");
    assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
    assert!(session.is_initialized());
    assert_eq!(session.context().project["name"], "alpha");
    assert_eq!(
        session.context().session_id.as_deref(),
        Some(session.id.as_str())
    );
}

#[tokio::test]
async fn lazy_loading_serves_the_meta_facade() {
    let (runtime, _dir) = runtime_with(serde_json::json!({
        "features": {"lazyLoading": true}
    }))
    .await;
    let session = open_session(&runtime).await;

    let response = unimcp_server::dispatch::handle_message(
        &runtime,
        &session,
        request("tools/list", serde_json::json!({})),
    )
    .await
    .unwrap();
    let tools = response.result.unwrap();
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["tool_list", "tool_schema", "tool_invoke"]);
}

#[tokio::test]
async fn meta_tool_list_with_bad_cursor_returns_first_page() {
    let (runtime, _dir) = runtime_with(serde_json::json!({
        "features": {"lazyLoading": true}
    }))
    .await;
    let session = open_session(&runtime).await;

    let response = unimcp_server::dispatch::handle_message(
        &runtime,
        &session,
        request(
            "tools/call",
            serde_json::json!({
                "name": "tool_list",
                "arguments": {"cursor": "not-base64!"}
            }),
        ),
    )
    .await
    .unwrap();
    // The façade answers (empty fleet, empty first page) instead of erroring.
    let result = response.result.unwrap();
    assert_eq!(result["isError"], false);
    assert_eq!(
        result["structuredContent"]["tools"].as_array().unwrap().len(),
        0
    );
}

#[tokio::test]
async fn unknown_tool_call_is_not_found() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let session = open_session(&runtime).await;

    let response = unimcp_server::dispatch::handle_message(
        &runtime,
        &session,
        request("tools/call", serde_json::json!({"name": "ghost_tool"})),
    )
    .await
    .unwrap();
    assert!(response.is_error());
    assert_eq!(response.error.unwrap().code, -32002);
}

#[tokio::test]
async fn logging_set_level_round_trips() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let session = open_session(&runtime).await;

    let response = unimcp_server::dispatch::handle_message(
        &runtime,
        &session,
        request("logging/setLevel", serde_json::json!({"level": "warning"})),
    )
    .await
    .unwrap();
    assert!(!response.is_error());
    assert_eq!(
        session.log_level(),
        Some(unimcp_protocol::LoggingLevel::Warning)
    );
}

#[tokio::test]
async fn http_rejects_combined_filter_params() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let app = unimcp_server::http::router(runtime);

    let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();
    let response = app
        .oneshot(
            Request::post("/mcp?tags=a&tag-filter=a%2Bb")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_rejects_malformed_tags() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let app = unimcp_server::http::router(runtime);

    let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();
    let response = app
        .oneshot(
            Request::post("/mcp?tags=bad%20tag")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_post_allocates_session_and_returns_header() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let app = unimcp_server::http::router(Arc::clone(&runtime));

    let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();
    let response = app
        .oneshot(
            Request::post("/mcp")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("session header present");
    assert!(session_id.starts_with("unimcp-"));
    assert!(runtime.sessions.get(session_id).is_some());
}

#[tokio::test]
async fn http_delete_tears_down_session() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let session = open_session(&runtime).await;
    let app = unimcp_server::http::router(Arc::clone(&runtime));

    let response = app
        .clone()
        .oneshot(
            Request::delete("/mcp")
                .header("mcp-session-id", session.id.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(runtime.sessions.get(&session.id).is_none());

    // Second delete: the session is gone.
    let response = app
        .oneshot(
            Request::delete("/mcp")
                .header("mcp-session-id", session.id.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_lists_connections() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;
    let app = unimcp_server::http::router(runtime);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn reload_of_identical_config_is_a_no_op() {
    let (runtime, _dir) = runtime_with(serde_json::json!({
        "mcpServers": {"a": {"command": "cat", "disabled": true}}
    }))
    .await;
    let snapshot = runtime.snapshot.load_full();
    let outcome = runtime.reload.apply((*snapshot).clone()).await;
    assert!(outcome.no_op);
}

#[tokio::test]
async fn detached_sessions_are_restorable_by_id() {
    let (runtime, _dir) = runtime_with(serde_json::json!({})).await;

    let session = open_session(&runtime).await;
    let id = session.id.clone();
    session.mark_initialized();
    runtime.sessions.update_persisted(&session).await;

    // A dropped GET stream detaches the transport, not the record; the
    // next request with the same id picks the session back up.
    runtime.sessions.close_transport(&id);
    let restored = runtime.sessions.restore_session(&id).await.unwrap();
    assert_eq!(restored.id, id);
    assert!(restored.is_initialized());
}
