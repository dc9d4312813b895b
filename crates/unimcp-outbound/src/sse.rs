//! Server-Sent Events decoding plus the legacy SSE client transport.
//!
//! The decoder is pure (bytes in, events out) and shared with the
//! streamable-HTTP transport. The legacy transport speaks the deprecated
//! two-endpoint dialect: `GET /sse` streams events and announces a POST
//! endpoint in its first `endpoint` event; requests go to that endpoint.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as StdMutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tracing::{debug, warn};
use unimcp_config::TransportKind;

use crate::error::{OutboundError, OutboundResult};
use crate::oauth::OAuthProvider;
use crate::transport::Transport;

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder: feed byte chunks, drain complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    current: SseEvent,
    ready: Vec<SseEvent>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; complete events accumulate for [`Self::drain`].
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.push_line(line);
        }
    }

    /// Take every fully-decoded event.
    pub fn drain(&mut self) -> Vec<SseEvent> {
        std::mem::take(&mut self.ready)
    }

    fn push_line(&mut self, line: &str) {
        if line.is_empty() {
            // Blank line terminates an event.
            if !self.current.data.is_empty() || self.current.event.is_some() {
                let mut event = std::mem::take(&mut self.current);
                // The spec appends a trailing newline per data line; strip
                // the final one.
                if event.data.ends_with('\n') {
                    event.data.pop();
                }
                self.ready.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return; // comment / keep-alive
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => {
                self.current.data.push_str(value);
                self.current.data.push('\n');
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            _ => {} // retry and unknown fields ignored
        }
    }
}

/// Configuration for the legacy SSE client transport.
#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// The `GET` stream URL (e.g. `http://host/sse`).
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
}

/// Legacy HTTP+SSE client transport.
pub struct SseClientTransport {
    config: SseClientConfig,
    http: reqwest::Client,
    oauth: Option<Arc<OAuthProvider>>,
    endpoint_rx: StdMutex<Option<watch::Receiver<Option<String>>>>,
    inbound_rx: TokioMutex<Option<mpsc::Receiver<String>>>,
    stream_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseClientTransport {
    pub fn new(config: SseClientConfig, oauth: Option<Arc<OAuthProvider>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            oauth,
            endpoint_rx: StdMutex::new(None),
            inbound_rx: TokioMutex::new(None),
            stream_task: StdMutex::new(None),
        }
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.config.headers {
            req = req.header(name, value);
        }
        if let Some(token) = self.oauth.as_ref().and_then(|o| o.access_token()) {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req
    }

    /// Resolve the announced endpoint, which may be relative to the stream URL.
    fn resolve_endpoint(&self, announced: &str) -> OutboundResult<String> {
        let base = url::Url::parse(&self.config.url)
            .map_err(|e| OutboundError::transport(format!("invalid sse url: {e}")))?;
        let joined = base
            .join(announced)
            .map_err(|e| OutboundError::transport(format!("invalid endpoint event: {e}")))?;
        Ok(joined.to_string())
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn connect(&self) -> OutboundResult<()> {
        if self.stream_task.lock().is_some() {
            return Ok(());
        }

        // No per-request timeout here: the response IS the long-lived
        // stream. The manager bounds the connect with its own deadline.
        let response = self
            .apply_headers(
                self.http
                    .get(&self.config.url)
                    .header("accept", "text/event-stream"),
            )
            .send()
            .await
            .map_err(|e| OutboundError::connection(format!("sse connect failed: {e}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let authorization_url = self
                .oauth
                .as_ref()
                .map_or_else(|| self.config.url.clone(), |o| o.authorization_url());
            return Err(OutboundError::OAuthRequired { authorization_url });
        }
        if !response.status().is_success() {
            return Err(OutboundError::connection(format!(
                "sse connect returned {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = watch::channel::<Option<String>>(None);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(256);
        let stream_url = self.config.url.clone();

        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(url = %stream_url, error = %e, "sse stream error");
                        break;
                    }
                };
                decoder.feed(&chunk);
                for event in decoder.drain() {
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            debug!(endpoint = %event.data, "sse endpoint announced");
                            let _ = endpoint_tx.send(Some(event.data));
                        }
                        _ => {
                            if inbound_tx.send(event.data).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!(url = %stream_url, "sse stream closed");
        });

        *self.endpoint_rx.lock() = Some(endpoint_rx);
        *self.inbound_rx.lock().await = Some(inbound_rx);
        *self.stream_task.lock() = Some(task);
        Ok(())
    }

    async fn send(&self, frame: String) -> OutboundResult<()> {
        let mut endpoint_rx = self
            .endpoint_rx
            .lock()
            .clone()
            .ok_or_else(|| OutboundError::transport("sse transport not connected"))?;

        // The endpoint event normally arrives immediately after connect.
        let current = endpoint_rx.borrow().clone();
        let announced = match current {
            Some(e) => e,
            None => {
                tokio::time::timeout(self.config.connect_timeout, async {
                    loop {
                        if endpoint_rx.changed().await.is_err() {
                            return None;
                        }
                        let value = endpoint_rx.borrow().clone();
                        if value.is_some() {
                            return value;
                        }
                    }
                })
                .await
                .map_err(|_| OutboundError::transport("no endpoint event received"))?
                .ok_or_else(|| OutboundError::transport("sse stream ended before endpoint"))?
            }
        };
        let endpoint = self.resolve_endpoint(&announced)?;

        let response = self
            .apply_headers(
                self.http
                    .post(&endpoint)
                    .header("content-type", "application/json")
                    .body(frame),
            )
            .send()
            .await
            .map_err(|e| OutboundError::transport(format!("sse post failed: {e}")))?;
        if !response.status().is_success() {
            return Err(OutboundError::transport(format!(
                "sse post returned {}",
                response.status()
            )));
        }
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
        if let Some(task) = self.stream_task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn oauth_provider(&self) -> Option<Arc<OAuthProvider>> {
        self.oauth.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"event: mess");
        decoder.feed(b"age\ndata: {\"a\":");
        decoder.feed(b"1}\n\n");
        let events = decoder.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn decoder_multiline_data() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: line1\ndata: line2\n\n");
        let events = decoder.drain();
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn decoder_skips_comments_and_ids() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b": keep-alive\nid: 42\ndata: x\n\n");
        let events = decoder.drain();
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn decoder_crlf_lines() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: x\r\n\r\n");
        assert_eq!(decoder.drain()[0].data, "x");
    }

    #[test]
    fn endpoint_resolution_joins_relative() {
        let transport = SseClientTransport::new(
            SseClientConfig {
                url: "http://host:9000/sse".to_string(),
                headers: BTreeMap::new(),
                connect_timeout: Duration::from_secs(5),
            },
            None,
        );
        assert_eq!(
            transport
                .resolve_endpoint("/messages?sessionId=abc")
                .unwrap(),
            "http://host:9000/messages?sessionId=abc"
        );
        assert_eq!(
            transport
                .resolve_endpoint("http://other/messages")
                .unwrap(),
            "http://other/messages"
        );
    }
}
