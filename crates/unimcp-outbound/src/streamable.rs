//! Streamable HTTP client transport.
//!
//! One endpoint for everything: requests POST to it, responses come back
//! as JSON or as a per-request SSE stream, and an optional long-lived GET
//! stream carries server-initiated messages. Session identity rides the
//! `mcp-session-id` header.
//!
//! A 401 anywhere surfaces as [`OutboundError::OAuthRequired`]; the
//! connection manager parks the upstream and exposes the authorization URL.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as StdMutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tracing::{debug, warn};
use unimcp_config::TransportKind;

use crate::error::{OutboundError, OutboundResult};
use crate::oauth::OAuthProvider;
use crate::sse::SseDecoder;
use crate::transport::Transport;

/// Header carrying the session id in both directions.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Configuration for the streamable HTTP client.
#[derive(Debug, Clone)]
pub struct StreamableClientConfig {
    /// Full endpoint URL (e.g. `http://host:3000/mcp`).
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
}

/// Client transport for the streamable HTTP dialect.
pub struct StreamableClientTransport {
    config: StreamableClientConfig,
    http: reqwest::Client,
    oauth: Option<Arc<OAuthProvider>>,
    session_id: StdMutex<Option<String>>,
    inbound_tx: StdMutex<Option<mpsc::Sender<String>>>,
    inbound_rx: TokioMutex<Option<mpsc::Receiver<String>>>,
    listener_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamableClientTransport {
    pub fn new(config: StreamableClientConfig, oauth: Option<Arc<OAuthProvider>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            oauth,
            session_id: StdMutex::new(None),
            inbound_tx: StdMutex::new(None),
            inbound_rx: TokioMutex::new(None),
            listener_task: StdMutex::new(None),
        }
    }

    /// Session id assigned by the upstream, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.config.headers {
            req = req.header(name, value);
        }
        if let Some(session) = self.session_id.lock().as_deref() {
            req = req.header(SESSION_ID_HEADER, session);
        }
        if let Some(token) = self.oauth.as_ref().and_then(|o| o.access_token()) {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req
    }

    fn oauth_required(&self) -> OutboundError {
        let authorization_url = self
            .oauth
            .as_ref()
            .map_or_else(|| self.config.url.clone(), |o| o.authorization_url());
        OutboundError::OAuthRequired { authorization_url }
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(SESSION_ID_HEADER) {
            if let Ok(session) = value.to_str() {
                let mut guard = self.session_id.lock();
                if guard.as_deref() != Some(session) {
                    debug!(session = %session, "upstream assigned session id");
                    *guard = Some(session.to_string());
                }
            }
        }
    }

    /// Open the long-lived GET stream once a session id exists. Servers
    /// without session support simply never get a back-channel.
    fn maybe_spawn_listener(&self) {
        if self.listener_task.lock().is_some() || self.session_id.lock().is_none() {
            return;
        }
        let Some(inbound_tx) = self.inbound_tx.lock().clone() else {
            return;
        };

        let request = self
            .apply_headers(
                self.http
                    .get(&self.config.url)
                    .header("accept", "text/event-stream"),
            )
            .build();
        let http = self.http.clone();
        let url = self.config.url.clone();

        let task = tokio::spawn(async move {
            let Ok(request) = request else { return };
            let response = match http.execute(request).await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    debug!(url = %url, status = %r.status(), "no server back-channel");
                    return;
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "back-channel connect failed");
                    return;
                }
            };
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        decoder.feed(&bytes);
                        for event in decoder.drain() {
                            if inbound_tx.send(event.data).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "back-channel stream ended");
                        return;
                    }
                }
            }
        });
        *self.listener_task.lock() = Some(task);
    }
}

#[async_trait]
impl Transport for StreamableClientTransport {
    async fn connect(&self) -> OutboundResult<()> {
        if self.inbound_tx.lock().is_some() {
            return Ok(());
        }
        url::Url::parse(&self.config.url)
            .map_err(|e| OutboundError::connection(format!("invalid url {}: {e}", self.config.url)))?;
        let (tx, rx) = mpsc::channel::<String>(256);
        *self.inbound_tx.lock() = Some(tx);
        *self.inbound_rx.lock().await = Some(rx);
        Ok(())
    }

    async fn send(&self, frame: String) -> OutboundResult<()> {
        let inbound_tx = self
            .inbound_tx
            .lock()
            .clone()
            .ok_or_else(|| OutboundError::transport("transport not connected"))?;

        // No per-request timeout: a POST may answer with a long-lived SSE
        // stream, and the client's per-call deadline bounds the exchange.
        let response = self
            .apply_headers(
                self.http
                    .post(&self.config.url)
                    .header("content-type", "application/json")
                    .header("accept", "application/json, text/event-stream")
                    .body(frame),
            )
            .send()
            .await
            .map_err(|e| OutboundError::transport(format!("post failed: {e}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(self.oauth_required());
        }
        if !response.status().is_success()
            && response.status() != reqwest::StatusCode::ACCEPTED
        {
            return Err(OutboundError::transport(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        self.capture_session(&response);
        self.maybe_spawn_listener();

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Per-request SSE response: drain it into the inbound channel.
            tokio::spawn(async move {
                let mut decoder = SseDecoder::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            decoder.feed(&bytes);
                            for event in decoder.drain() {
                                if inbound_tx.send(event.data).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "response stream error");
                            return;
                        }
                    }
                }
            });
        } else if content_type.starts_with("application/json") {
            let body = response
                .text()
                .await
                .map_err(|e| OutboundError::transport(format!("body read failed: {e}")))?;
            if !body.is_empty() {
                let _ = inbound_tx.send(body).await;
            }
        }
        // 202/204 with no body: nothing to deliver.
        Ok(())
    }

    async fn receive(&self) -> OutboundResult<Option<String>> {
        let mut guard = self.inbound_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Ok(None),
        }
    }

    async fn close(&self) -> OutboundResult<()> {
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
        // Best-effort session teardown.
        let session = self.session_id.lock().clone();
        if session.is_some() {
            let _ = self
                .apply_headers(self.http.delete(&self.config.url))
                .timeout(Duration::from_secs(2))
                .send()
                .await;
        }
        self.inbound_tx.lock().take();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn oauth_provider(&self) -> Option<Arc<OAuthProvider>> {
        self.oauth.clone()
    }
}
