//! The inbound HTTP surface.
//!
//! - `/mcp`: streamable HTTP (primary). POST requests, GET back-channel,
//!   DELETE teardown, session identity in `mcp-session-id`.
//! - `/sse` + `/messages`: the deprecated two-endpoint dialect, kept as a
//!   compatibility shim.
//! - OAuth 2.1 endpoints and the authorization-server metadata document.
//! - Sideband: `/health` and `/oauth/connections` for operators.
//!
//! This module is the only place errors become HTTP responses.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::{Stream, StreamExt as _};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use unimcp_auth::{AuthorizeParams, RegisterParams, TokenParams, scopes_to_expression};
use unimcp_protocol::jsonrpc::JsonRpcMessage;
use unimcp_tags::{TagExpression, parse_advanced, parse_simple};
use unimcp_template::ContextData;

use crate::dispatch;
use crate::error::{ProxyError, ProxyResult};
use crate::runtime::Runtime;
use crate::session::{
    InboundSession, InboundTransport, SessionFilter, SessionService, TagFilterMode,
};

/// Session id header for the streamable dialect.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Build the router.
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete))
        .route("/sse", get(sse_get))
        .route("/messages", post(messages_post))
        .route("/authorize", get(oauth_authorize))
        .route("/token", post(oauth_token))
        .route("/revoke", post(oauth_revoke))
        .route("/register", post(oauth_register))
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth_metadata),
        )
        .route("/health", get(health))
        .route("/oauth/connections", get(oauth_connections))
        .route("/oauth/connections/{key}/finish", post(oauth_finish))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Consistent JSON error envelope.
fn api_error(error: &ProxyError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": { "code": error.code(), "message": error.to_string() }
        })),
    )
        .into_response()
}

/// OAuth endpoints answer in RFC 6749 error shape instead.
fn oauth_error(error: &ProxyError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    (
        status,
        Json(json!({
            "error": error.code(),
            "error_description": error.to_string(),
        })),
    )
        .into_response()
}

fn client_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Parse the mutually-exclusive filter query parameters.
fn parse_filter(
    runtime: &Arc<Runtime>,
    query: &HashMap<String, String>,
) -> ProxyResult<SessionFilter> {
    let preset = query.get("preset");
    let advanced = query.get("tag-filter");
    let simple = query.get("tags");

    let provided = [preset.is_some(), advanced.is_some(), simple.is_some()]
        .iter()
        .filter(|p| **p)
        .count();
    if provided > 1 {
        return Err(ProxyError::invalid_params(
            "preset, tag-filter, and tags are mutually exclusive",
        ));
    }

    if let Some(name) = preset {
        let expression = runtime.presets.resolve(name)?;
        return Ok(SessionFilter {
            mode: TagFilterMode::Preset,
            expression: Some(expression),
            preset_name: Some(name.clone()),
        });
    }
    if let Some(raw) = advanced {
        let expression = parse_advanced(raw)?;
        return Ok(SessionFilter {
            mode: TagFilterMode::Advanced,
            expression: Some(expression),
            preset_name: None,
        });
    }
    if let Some(raw) = simple {
        let tags = parse_simple(raw)?;
        return Ok(SessionFilter {
            mode: TagFilterMode::SimpleOr,
            expression: Some(TagExpression::any_of(tags)),
            preset_name: None,
        });
    }
    Ok(SessionFilter::none())
}

/// Bearer-token verification. `None` when auth is disabled; the derived
/// expression is the OR of the token's tags, used when the session gives
/// no explicit filter.
async fn verify_bearer(
    runtime: &Arc<Runtime>,
    headers: &HeaderMap,
) -> ProxyResult<Option<TagExpression>> {
    if !runtime.auth.enabled() {
        return Ok(None);
    }
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ProxyError::Auth(unimcp_auth::AuthError::InvalidClient(
                "missing bearer token".to_string(),
            ))
        })?;
    let info = runtime
        .auth
        .verify_access_token(&runtime.available_tags(), token)
        .await?;
    Ok(Some(scopes_to_expression(&info.scopes)))
}

async fn open_http_session(
    runtime: &Arc<Runtime>,
    transport: InboundTransport,
    query: &HashMap<String, String>,
    scope_filter: Option<TagExpression>,
) -> ProxyResult<Arc<InboundSession>> {
    let mut filter = parse_filter(runtime, query)?;
    // Token scopes bound the session when no explicit filter was chosen.
    if filter.expression.is_none() {
        if let Some(expression) = scope_filter {
            filter = SessionFilter {
                mode: TagFilterMode::SimpleOr,
                expression: Some(expression),
                preset_name: None,
            };
        }
    }

    let enable_pagination = query
        .get("pagination")
        .map(|v| v == "true" || v == "1")
        .unwrap_or_else(|| runtime.snapshot.load().features.pagination);

    Ok(runtime
        .sessions
        .open_session(crate::session::SessionOptions {
            transport,
            filter,
            enable_pagination,
            context: ContextData::default(),
            fixed_id: None,
        })
        .await)
}

// ---------------------------------------------------------------------
// Streamable HTTP
// ---------------------------------------------------------------------

async fn mcp_post(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let scope_filter = match verify_bearer(&runtime, &headers).await {
        Ok(filter) => filter,
        Err(e) => return api_error(&e),
    };

    let session = match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) => match runtime.sessions.restore_session(id).await {
            Ok(session) => session,
            // A known-shape id with no record is recreated rather than
            // rejected; foreign ids are not honored.
            Err(ProxyError::UnknownSession(_)) if unimcp_core::id::is_service_id(id) => {
                let filter = match parse_filter(&runtime, &query) {
                    Ok(filter) => filter,
                    Err(e) => return api_error(&e),
                };
                runtime
                    .sessions
                    .open_session(crate::session::SessionOptions {
                        transport: InboundTransport::StreamableHttp,
                        filter,
                        enable_pagination: runtime.snapshot.load().features.pagination,
                        context: ContextData::default(),
                        fixed_id: Some(id.to_string()),
                    })
                    .await
            }
            Err(e) => return api_error(&e),
        },
        None => {
            match open_http_session(&runtime, InboundTransport::StreamableHttp, &query, scope_filter)
                .await
            {
                Ok(session) => session,
                Err(e) => return api_error(&e),
            }
        }
    };

    let message = match JsonRpcMessage::from_str(&body) {
        Ok(message) => message,
        Err(e) => {
            return api_error(&ProxyError::invalid_params(format!("malformed frame: {e}")));
        }
    };

    let response = dispatch::handle_message(&runtime, &session, message).await;
    let mut http_response = match response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = session.id.parse() {
        http_response.headers_mut().insert(SESSION_HEADER, value);
    }
    http_response
}

async fn mcp_get(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_bearer(&runtime, &headers).await {
        return api_error(&e);
    }
    let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return api_error(&ProxyError::invalid_params(
            "GET /mcp requires mcp-session-id",
        ));
    };
    let session = match runtime.sessions.restore_session(id).await {
        Ok(session) => session,
        Err(e) => return api_error(&e),
    };

    let rx = session.attach_channel();
    debug!(session = %session.id, "back-channel attached");
    let stream = ChannelStream {
        inner: UnboundedReceiverStream::new(rx),
        _guard: DetachGuard {
            sessions: Arc::clone(&runtime.sessions),
            session_id: session.id.clone(),
        },
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new())
        .into_response()
}

async fn mcp_delete(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return api_error(&ProxyError::invalid_params(
            "DELETE /mcp requires mcp-session-id",
        ));
    };
    let id = id.to_string();
    runtime.factory.detach_session(&id).await;
    match runtime.sessions.delete_session(&id).await {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => api_error(&ProxyError::UnknownSession(id)),
    }
}

/// Back-channel stream: frames out as SSE events; dropping the stream
/// (client disconnect) detaches the transport but keeps the session.
struct ChannelStream {
    inner: UnboundedReceiverStream<Value>,
    _guard: DetachGuard,
}

struct DetachGuard {
    sessions: Arc<SessionService>,
    session_id: String,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.sessions.close_transport(&self.session_id);
    }
}

impl Stream for ChannelStream {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(frame)) => {
                Poll::Ready(Some(Ok(Event::default().data(frame.to_string()))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---------------------------------------------------------------------
// Legacy HTTP+SSE
// ---------------------------------------------------------------------

async fn sse_get(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let scope_filter = match verify_bearer(&runtime, &headers).await {
        Ok(filter) => filter,
        Err(e) => return api_error(&e),
    };
    let session =
        match open_http_session(&runtime, InboundTransport::Sse, &query, scope_filter).await {
            Ok(session) => session,
            Err(e) => return api_error(&e),
        };

    let rx = session.attach_channel();
    let endpoint = format!("/messages?sessionId={}", session.id);
    let first = futures::stream::once(async move {
        Ok::<_, std::convert::Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let rest = ChannelStream {
        inner: UnboundedReceiverStream::new(rx),
        _guard: DetachGuard {
            sessions: Arc::clone(&runtime.sessions),
            session_id: session.id.clone(),
        },
    };
    Sse::new(first.chain(rest))
        .keep_alive(KeepAlive::new())
        .into_response()
}

async fn messages_post(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let Some(id) = query.get("sessionId") else {
        return api_error(&ProxyError::invalid_params("sessionId is required"));
    };
    let Some(session) = runtime.sessions.get(id) else {
        return api_error(&ProxyError::UnknownSession(id.clone()));
    };

    let message = match JsonRpcMessage::from_str(&body) {
        Ok(message) => message,
        Err(e) => {
            return api_error(&ProxyError::invalid_params(format!("malformed frame: {e}")));
        }
    };

    // Responses travel back over the SSE stream; JSON-RPC errors ride it
    // as error frames while the HTTP status stays 202.
    if let Some(response) = dispatch::handle_message(&runtime, &session, message).await {
        match serde_json::to_value(&response) {
            Ok(frame) => session.send_frame(frame),
            Err(e) => warn!(session = %session.id, error = %e, "unserializable response"),
        }
    }
    StatusCode::ACCEPTED.into_response()
}

// ---------------------------------------------------------------------
// OAuth endpoints
// ---------------------------------------------------------------------

async fn oauth_authorize(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if let Err(e) = runtime.limiter.check(&client_key(&headers, peer)) {
        return oauth_error(&ProxyError::Auth(e));
    }
    match runtime
        .auth
        .authorize(&runtime.available_tags(), params)
        .await
    {
        Ok(location) => Redirect::to(&location).into_response(),
        Err(e) => oauth_error(&ProxyError::Auth(e)),
    }
}

async fn oauth_token(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Form(params): Form<TokenParams>,
) -> Response {
    if let Err(e) = runtime.limiter.check(&client_key(&headers, peer)) {
        return oauth_error(&ProxyError::Auth(e));
    }
    match runtime.auth.exchange_authorization_code(params).await {
        Ok(token) => Json(token).into_response(),
        Err(e) => oauth_error(&ProxyError::Auth(e)),
    }
}

#[derive(serde::Deserialize)]
struct RevokeParams {
    token: String,
}

async fn oauth_revoke(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Form(params): Form<RevokeParams>,
) -> Response {
    if let Err(e) = runtime.limiter.check(&client_key(&headers, peer)) {
        return oauth_error(&ProxyError::Auth(e));
    }
    runtime.auth.revoke_token(&params.token).await;
    Json(json!({})).into_response()
}

async fn oauth_register(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(params): Json<RegisterParams>,
) -> Response {
    if let Err(e) = runtime.limiter.check(&client_key(&headers, peer)) {
        return oauth_error(&ProxyError::Auth(e));
    }
    match runtime.auth.register(params).await {
        Ok(registration) => (StatusCode::CREATED, Json(registration)).into_response(),
        Err(e) => oauth_error(&ProxyError::Auth(e)),
    }
}

async fn oauth_metadata(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let issuer = format!("http://{host}");
    Json(runtime.auth.metadata(&issuer, &runtime.available_tags())).into_response()
}

// ---------------------------------------------------------------------
// Sideband
// ---------------------------------------------------------------------

async fn health(State(runtime): State<Arc<Runtime>>) -> Response {
    let connections = runtime.manager.status_snapshot();
    let sessions = runtime.sessions.all();
    Json(json!({
        "status": "ok",
        "sessions": sessions.len(),
        "connections": connections,
    }))
    .into_response()
}

async fn oauth_connections(State(runtime): State<Arc<Runtime>>) -> Response {
    let awaiting: Vec<_> = runtime
        .manager
        .status_snapshot()
        .into_iter()
        .filter(|c| c.status == unimcp_outbound::ConnectionStatus::AwaitingOAuth)
        .collect();
    Json(json!({ "connections": awaiting })).into_response()
}

#[derive(serde::Deserialize)]
struct FinishParams {
    code: String,
}

async fn oauth_finish(
    State(runtime): State<Arc<Runtime>>,
    Path(key): Path<String>,
    Json(params): Json<FinishParams>,
) -> Response {
    let Some(key) = runtime.resolver.parse_key(&key) else {
        return api_error(&ProxyError::invalid_params("malformed connection key"));
    };
    match runtime.manager.finish_oauth(&key, &params.code).await {
        Ok(()) => Json(json!({ "status": "connecting" })).into_response(),
        Err(e) => api_error(&ProxyError::Outbound(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_key_prefers_forwarded_header() {
        let peer: SocketAddr = "192.0.2.9:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_key(&headers, peer), "10.1.2.3");
        assert_eq!(client_key(&HeaderMap::new(), peer), "192.0.2.9");
    }
}
