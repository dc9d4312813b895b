//! Inbound sessions and their service.
//!
//! A session is the durable downstream binding: filter, context, and (for
//! streamable HTTP) persisted metadata that survives process restarts. The
//! transport attached to a session is ephemeral; a dropped GET stream
//! tears down the channel, not the record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use unimcp_auth::{KeyValueRepository, keys};
use unimcp_protocol::jsonrpc::JsonRpcNotification;
use unimcp_protocol::types::{LoggingLevel, methods};
use unimcp_tags::{TagExpression, parse_advanced};
use unimcp_template::ContextData;

use crate::error::{ProxyError, ProxyResult};

/// Inbound transport families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundTransport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Initializing,
    Connected,
    Disconnected,
    Error,
}

/// Which of the mutually-exclusive filter inputs produced the expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagFilterMode {
    None,
    SimpleOr,
    Advanced,
    Preset,
}

/// A session's resolved filter.
#[derive(Debug, Clone)]
pub struct SessionFilter {
    pub mode: TagFilterMode,
    pub expression: Option<TagExpression>,
    pub preset_name: Option<String>,
}

impl SessionFilter {
    pub fn none() -> Self {
        Self {
            mode: TagFilterMode::None,
            expression: None,
            preset_name: None,
        }
    }
}

/// One inbound session.
#[derive(Debug)]
pub struct InboundSession {
    pub id: String,
    pub transport: InboundTransport,
    pub filter: SessionFilter,
    pub enable_pagination: bool,
    status: RwLock<SessionStatus>,
    context: RwLock<ContextData>,
    log_level: RwLock<Option<LoggingLevel>>,
    pub connected_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    last_error: RwLock<Option<String>>,
    initialized: AtomicBool,
    /// Writer side of the attached back-channel (SSE stream or stdio
    /// writer); absent while no transport is attached. Carries raw frames
    /// so the legacy SSE dialect can push responses through it too.
    notify_tx: RwLock<Option<mpsc::UnboundedSender<serde_json::Value>>>,
    /// Per-method trailing-edge suppression for list-changed fan-out.
    debounce: Mutex<HashMap<String, Instant>>,
    debounce_window: Duration,
    /// Qualified capability sets as of the last fan-out; the baseline the
    /// next fan-out diffs against.
    last_view: Mutex<Option<unimcp_registry::QualifiedSets>>,
}

impl InboundSession {
    fn new(
        id: String,
        transport: InboundTransport,
        filter: SessionFilter,
        enable_pagination: bool,
        context: ContextData,
    ) -> Self {
        Self {
            id,
            transport,
            filter,
            enable_pagination,
            status: RwLock::new(SessionStatus::Initializing),
            context: RwLock::new(context),
            log_level: RwLock::new(None),
            connected_at: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            last_error: RwLock::new(None),
            initialized: AtomicBool::new(false),
            notify_tx: RwLock::new(None),
            debounce: Mutex::new(HashMap::new()),
            debounce_window: Duration::from_millis(300),
            last_view: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub fn context(&self) -> ContextData {
        self.context.read().clone()
    }

    /// Merge the context supplied at `initialize`, stamping session
    /// identity fields the client cannot be trusted to set.
    pub fn set_context(&self, mut context: ContextData) {
        context.session_id = Some(self.id.clone());
        if context.timestamp.is_none() {
            context.timestamp = Some(Utc::now().to_rfc3339());
        }
        *self.context.write() = context;
    }

    pub fn log_level(&self) -> Option<LoggingLevel> {
        *self.log_level.read()
    }

    pub fn set_log_level(&self, level: LoggingLevel) {
        *self.log_level.write() = Some(level);
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    /// Whether `initialize` has completed (or the session was restored).
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Attach a back-channel; replaces any previous one.
    pub fn attach_channel(&self) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.write() = Some(tx);
        self.set_status(SessionStatus::Connected);
        rx
    }

    /// Drop the back-channel; the session record survives.
    pub fn detach_channel(&self) {
        self.notify_tx.write().take();
        self.set_status(SessionStatus::Disconnected);
    }

    pub fn has_channel(&self) -> bool {
        self.notify_tx.read().is_some()
    }

    /// Send a notification, collapsing repeats of the same method inside
    /// the debounce window.
    pub fn notify(&self, note: JsonRpcNotification) {
        {
            let mut debounce = self.debounce.lock();
            let now = Instant::now();
            if let Some(last) = debounce.get(&note.method) {
                if now.duration_since(*last) < self.debounce_window {
                    return;
                }
            }
            debounce.insert(note.method.clone(), now);
        }
        match serde_json::to_value(&note) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!(session = %self.id, error = %e, "unserializable notification"),
        }
    }

    /// Relay an upstream log message if it clears the session's level gate.
    pub fn relay_log(&self, note: JsonRpcNotification) {
        if let Some(minimum) = self.log_level() {
            let level = note
                .params
                .as_ref()
                .and_then(|p| p.get("level"))
                .and_then(|l| serde_json::from_value::<LoggingLevel>(l.clone()).ok());
            if level.is_some_and(|l| l < minimum) {
                return;
            }
        }
        if let Ok(frame) = serde_json::to_value(&note) {
            self.send_frame(frame);
        }
    }

    /// Replace the fan-out baseline, returning the previous one
    /// (`None` before the first exchange).
    pub fn replace_view_baseline(
        &self,
        view: unimcp_registry::QualifiedSets,
    ) -> Option<unimcp_registry::QualifiedSets> {
        self.last_view.lock().replace(view)
    }

    /// Push a raw frame onto the back-channel (legacy SSE responses ride
    /// the same stream as notifications).
    pub fn send_frame(&self, frame: serde_json::Value) {
        if let Some(tx) = self.notify_tx.read().as_ref() {
            if tx.send(frame).is_err() {
                debug!(session = %self.id, "frame dropped, channel gone");
            }
        }
    }
}

/// Options for opening a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub transport: InboundTransport,
    pub filter: SessionFilter,
    pub enable_pagination: bool,
    pub context: ContextData,
    /// Reuse this id instead of minting one (stdio uses `"stdio"`).
    pub fixed_id: Option<String>,
}

/// Persisted streamable-HTTP session metadata.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    id: String,
    transport: InboundTransport,
    filter_mode: TagFilterMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preset_name: Option<String>,
    enable_pagination: bool,
    context: ContextData,
    connected_at: DateTime<Utc>,
}

/// Owner of every inbound session record.
pub struct SessionService {
    sessions: DashMap<String, Arc<InboundSession>>,
    persist: Arc<dyn KeyValueRepository>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(persist: Arc<dyn KeyValueRepository>, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            persist,
            ttl,
        }
    }

    /// Create a session, persisting streamable-HTTP metadata.
    pub async fn open_session(&self, options: SessionOptions) -> Arc<InboundSession> {
        let id = options
            .fixed_id
            .unwrap_or_else(unimcp_core::mint_session_id);
        let session = Arc::new(InboundSession::new(
            id.clone(),
            options.transport,
            options.filter,
            options.enable_pagination,
            options.context,
        ));
        self.sessions.insert(id.clone(), Arc::clone(&session));

        if options.transport == InboundTransport::StreamableHttp {
            self.persist_session(&session).await;
        }
        info!(session = %id, transport = ?options.transport, "session opened");
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<InboundSession>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All live sessions.
    pub fn all(&self) -> Vec<Arc<InboundSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Restore a streamable session from persisted state. The restored
    /// session keeps its id, filter, preset, and context, and is marked
    /// already-initialized: the downstream will not re-send `initialize`.
    pub async fn restore_session(&self, session_id: &str) -> ProxyResult<Arc<InboundSession>> {
        if let Some(live) = self.get(session_id) {
            return Ok(live);
        }
        let value = self
            .persist
            .get(&format!("{}{session_id}", keys::TRANSPORT))
            .await
            .map_err(ProxyError::Auth)?
            .ok_or_else(|| ProxyError::UnknownSession(session_id.to_string()))?;
        let persisted: PersistedSession = serde_json::from_value(value)?;

        let expression = persisted
            .tag_expression
            .as_deref()
            .map(parse_advanced)
            .transpose()?;
        let session = Arc::new(InboundSession::new(
            persisted.id.clone(),
            persisted.transport,
            SessionFilter {
                mode: persisted.filter_mode,
                expression,
                preset_name: persisted.preset_name,
            },
            persisted.enable_pagination,
            persisted.context,
        ));
        session.mark_initialized();
        session.set_status(SessionStatus::Connected);
        self.sessions
            .insert(persisted.id.clone(), Arc::clone(&session));
        info!(session = %persisted.id, "session restored from persisted state");
        Ok(session)
    }

    /// Tear down the attached transport but keep the record (long-lived
    /// GET stream dropped).
    pub fn close_transport(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.detach_channel();
            debug!(session = %session_id, "transport detached, session retained");
        }
    }

    /// Explicit client-initiated termination: record and persisted state
    /// both go.
    pub async fn delete_session(&self, session_id: &str) -> Option<Arc<InboundSession>> {
        let removed = self
            .sessions
            .remove(session_id)
            .map(|(_, session)| session);
        if removed.is_some() {
            let _ = self
                .persist
                .delete(&format!("{}{session_id}", keys::TRANSPORT))
                .await;
            info!(session = %session_id, "session deleted");
        }
        removed
    }

    /// Evict sessions idle past the TTL; returns the evicted records so
    /// the caller can release their per-session upstreams.
    pub async fn sweep_expired(&self) -> Vec<Arc<InboundSession>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().last_activity() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        let mut evicted = Vec::new();
        for id in expired {
            warn!(session = %id, "session expired, evicting");
            if let Some(session) = self.delete_session(&id).await {
                evicted.push(session);
            }
        }
        evicted
    }

    async fn persist_session(&self, session: &Arc<InboundSession>) {
        let persisted = PersistedSession {
            id: session.id.clone(),
            transport: session.transport,
            filter_mode: session.filter.mode,
            tag_expression: session.filter.expression.as_ref().map(ToString::to_string),
            preset_name: session.filter.preset_name.clone(),
            enable_pagination: session.enable_pagination,
            context: session.context(),
            connected_at: session.connected_at,
        };
        match serde_json::to_value(&persisted) {
            Ok(value) => {
                if let Err(e) = self
                    .persist
                    .save(&format!("{}{}", keys::TRANSPORT, session.id), value, self.ttl)
                    .await
                {
                    warn!(session = %session.id, error = %e, "failed to persist session");
                }
            }
            Err(e) => warn!(session = %session.id, error = %e, "failed to serialize session"),
        }
    }

    /// Re-persist after the context lands at `initialize`.
    pub async fn update_persisted(&self, session: &Arc<InboundSession>) {
        if session.transport == InboundTransport::StreamableHttp {
            self.persist_session(session).await;
        }
    }

    /// Emit list-changed notifications for the categories that changed,
    /// per session (the caller supplies the per-session decision).
    pub fn notify_list_changed(
        session: &Arc<InboundSession>,
        tools: bool,
        resources: bool,
        prompts: bool,
    ) {
        if tools {
            session.notify(JsonRpcNotification::new(methods::TOOLS_LIST_CHANGED, None));
        }
        if resources {
            session.notify(JsonRpcNotification::new(
                methods::RESOURCES_LIST_CHANGED,
                None,
            ));
        }
        if prompts {
            session.notify(JsonRpcNotification::new(methods::PROMPTS_LIST_CHANGED, None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unimcp_auth::MemoryRepository;

    fn service() -> SessionService {
        SessionService::new(Arc::new(MemoryRepository::new()), Duration::from_secs(60))
    }

    fn options(transport: InboundTransport) -> SessionOptions {
        SessionOptions {
            transport,
            filter: SessionFilter::none(),
            enable_pagination: false,
            context: ContextData::default(),
            fixed_id: None,
        }
    }

    #[tokio::test]
    async fn open_get_delete() {
        let service = service();
        let session = service
            .open_session(options(InboundTransport::StreamableHttp))
            .await;
        assert!(session.id.starts_with("unimcp-"));
        assert!(service.get(&session.id).is_some());

        service.delete_session(&session.id).await;
        assert!(service.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn restore_preserves_identity_and_marks_initialized() {
        let repo: Arc<dyn KeyValueRepository> = Arc::new(MemoryRepository::new());
        let service = SessionService::new(Arc::clone(&repo), Duration::from_secs(60));

        let mut opts = options(InboundTransport::StreamableHttp);
        opts.filter = SessionFilter {
            mode: TagFilterMode::Advanced,
            expression: Some(parse_advanced("web+!db").unwrap()),
            preset_name: None,
        };
        let session = service.open_session(opts).await;
        let id = session.id.clone();
        session.set_context(ContextData {
            project: serde_json::json!({"name": "alpha"}),
            ..Default::default()
        });
        service.update_persisted(&session).await;

        // Simulate a process restart: a fresh service over the same repo.
        let service2 = SessionService::new(repo, Duration::from_secs(60));
        let restored = service2.restore_session(&id).await.unwrap();
        assert_eq!(restored.id, id);
        assert!(restored.is_initialized());
        assert_eq!(restored.filter.mode, TagFilterMode::Advanced);
        assert_eq!(
            restored.filter.expression.as_ref().unwrap().to_string(),
            "web+!db"
        );
        assert_eq!(restored.context().project["name"], "alpha");
        assert_eq!(
            restored.context().session_id.as_deref(),
            Some(id.as_str())
        );
    }

    #[tokio::test]
    async fn restore_unknown_session_fails() {
        let service = service();
        let err = service.restore_session("unimcp-nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn transport_detach_keeps_record() {
        let service = service();
        let session = service
            .open_session(options(InboundTransport::StreamableHttp))
            .await;
        let _rx = session.attach_channel();
        assert!(session.has_channel());
        assert_eq!(session.status(), SessionStatus::Connected);

        service.close_transport(&session.id);
        assert!(!session.has_channel());
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(service.get(&session.id).is_some());
    }

    #[tokio::test]
    async fn notifications_debounce_per_method() {
        let service = service();
        let session = service
            .open_session(options(InboundTransport::StreamableHttp))
            .await;
        let mut rx = session.attach_channel();

        for _ in 0..4 {
            session.notify(JsonRpcNotification::new(methods::TOOLS_LIST_CHANGED, None));
        }
        session.notify(JsonRpcNotification::new(methods::PROMPTS_LIST_CHANGED, None));

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(frame["method"].as_str().unwrap().to_string());
        }
        assert_eq!(
            received,
            vec![
                methods::TOOLS_LIST_CHANGED.to_string(),
                methods::PROMPTS_LIST_CHANGED.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn log_gate_filters_below_level() {
        let service = service();
        let session = service
            .open_session(options(InboundTransport::StreamableHttp))
            .await;
        let mut rx = session.attach_channel();
        session.set_log_level(LoggingLevel::Warning);

        session.relay_log(JsonRpcNotification::new(
            methods::LOGGING_MESSAGE,
            Some(serde_json::json!({"level": "debug", "data": "noise"})),
        ));
        session.relay_log(JsonRpcNotification::new(
            methods::LOGGING_MESSAGE,
            Some(serde_json::json!({"level": "error", "data": "important"})),
        ));

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(frame);
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["params"]["level"], "error");
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let repo: Arc<dyn KeyValueRepository> = Arc::new(MemoryRepository::new());
        let service = SessionService::new(repo, Duration::from_millis(0));
        let session = service
            .open_session(options(InboundTransport::StreamableHttp))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let evicted = service.sweep_expired().await;
        assert_eq!(evicted.len(), 1);
        assert!(service.get(&session.id).is_none());
    }
}
