//! The Outbound Connection Manager.
//!
//! Owns every live upstream client. Each connection runs a lifecycle task:
//!
//! ```text
//!          (config add)
//!            │
//!            ▼
//!       Connecting ──connect OK──▶ Connected ──close/err──▶ Disconnected
//!            │                        │
//!    need-auth│                        │ config remove
//!            ▼                        ▼
//!      AwaitingOAuth ─finishAuth─▶ Connecting
//!            │
//!            └──abandon──▶ Error
//! ```
//!
//! Mutations go through the manager; everyone else reads snapshots.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chrono::{DateTime, Utc};
use unimcp_config::{McpServerParams, TransportKind};
use unimcp_core::ParallelExecutor;
use unimcp_protocol::jsonrpc::JsonRpcNotification;
use unimcp_template::ContextData;

use crate::client::{ClientConfig, McpClient};
use crate::error::{OutboundError, OutboundResult};
use crate::key::ConnectionKey;
use crate::oauth::OAuthProvider;
use crate::sse::{SseClientConfig, SseClientTransport};
use crate::stdio::{ChildProcessConfig, ChildProcessTransport};
use crate::streamable::{StreamableClientConfig, StreamableClientTransport};
use crate::transport::Transport;

/// Lifecycle state of one outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    AwaitingOAuth,
    Error,
    Disconnected,
}

/// One live (or parked) upstream binding. Mutated only by the manager.
pub struct OutboundConnection {
    pub key: ConnectionKey,
    params: RwLock<McpServerParams>,
    context: RwLock<Option<ContextData>>,
    tags: RwLock<Vec<String>>,
    status: RwLock<ConnectionStatus>,
    client: RwLock<Option<Arc<McpClient>>>,
    oauth: RwLock<Option<Arc<OAuthProvider>>>,
    authorization_url: RwLock<Option<String>>,
    last_connected: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    lifecycle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OutboundConnection {
    fn new(key: ConnectionKey, params: McpServerParams, context: Option<ContextData>) -> Self {
        let tags = params.tags.clone();
        Self {
            key,
            params: RwLock::new(params),
            context: RwLock::new(context),
            tags: RwLock::new(tags),
            status: RwLock::new(ConnectionStatus::Connecting),
            client: RwLock::new(None),
            oauth: RwLock::new(None),
            authorization_url: RwLock::new(None),
            last_connected: RwLock::new(None),
            last_error: RwLock::new(None),
            lifecycle: Mutex::new(None),
        }
    }

    /// Logical server name.
    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// The live client, present only while `Connected`.
    pub fn client(&self) -> Option<Arc<McpClient>> {
        self.client.read().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn authorization_url(&self) -> Option<String> {
        self.authorization_url.read().clone()
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        *self.last_connected.read()
    }

    /// Upstream-provided instructions, when connected.
    pub fn instructions(&self) -> Option<String> {
        self.client().and_then(|c| c.instructions())
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }
}

/// Serializable per-connection view for the sideband surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub key: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bound on concurrent connection attempts in `create_all`.
    pub max_concurrent: usize,
    /// Retry attempts per connection before parking in `Error`.
    pub max_attempts: u32,
    /// Base retry delay; doubles per attempt.
    pub base_delay: Duration,
    /// Retry delay ceiling.
    pub max_delay: Duration,
    /// Transport connect deadline when params give none.
    pub connect_timeout: Duration,
    /// Name this proxy advertises; upstreams reporting it are circular.
    pub advertised_name: String,
    /// Client defaults (request timeout, debounce).
    pub client: ClientConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_attempts: 6,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            advertised_name: "unimcp".to_string(),
            client: ClientConfig::default(),
        }
    }
}

/// Notifications fan-in: `(origin connection, upstream notification)`.
pub type UpstreamNotification = (ConnectionKey, JsonRpcNotification);

/// Synthetic event the manager emits when a connection gains or loses its
/// capability surface (connect, disconnect, exhausted retries). Consumers
/// treat it like an upstream list-changed: refresh, diff, fan out.
pub const CAPABILITIES_EVENT: &str = "unimcp/capabilitiesChanged";

/// The manager. Construct once, share via `Arc`.
pub struct OutboundManager {
    config: ManagerConfig,
    connections: DashMap<ConnectionKey, Arc<OutboundConnection>>,
    notifications_tx: mpsc::UnboundedSender<UpstreamNotification>,
}

impl OutboundManager {
    /// Create a manager and the receiver for upstream notifications.
    pub fn new(config: ManagerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                connections: DashMap::new(),
                notifications_tx: tx,
            }),
            rx,
        )
    }

    /// Start every enabled server from a config map, bounded concurrency.
    pub async fn create_all(
        self: &Arc<Self>,
        servers: &BTreeMap<String, McpServerParams>,
    ) -> HashMap<ConnectionKey, Arc<OutboundConnection>> {
        let inputs: Vec<(String, McpServerParams)> = servers
            .iter()
            .filter(|(_, p)| !p.disabled)
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect();

        let manager = Arc::clone(self);
        let executor = ParallelExecutor::new(self.config.max_concurrent);
        let outcome = executor
            .run(
                inputs,
                move |(name, params)| {
                    let manager = Arc::clone(&manager);
                    async move { manager.create_one(&name, params).await }
                },
                None,
            )
            .await;

        let mut created = HashMap::new();
        for (_, result) in outcome.results {
            match result {
                Ok(connection) => {
                    created.insert(connection.key.clone(), connection);
                }
                Err(e) => warn!(error = %e, "failed to create outbound connection"),
            }
        }
        created
    }

    /// Start (or return) the static connection for `name`.
    pub async fn create_one(
        self: &Arc<Self>,
        name: &str,
        params: McpServerParams,
    ) -> OutboundResult<Arc<OutboundConnection>> {
        self.create_keyed(ConnectionKey::Static(name.to_string()), params, None)
            .await
    }

    /// Start (or return) a connection under an explicit key. Template
    /// instances land here from the per-session factory, carrying the
    /// session's context for the upstream handshake.
    pub async fn create_keyed(
        self: &Arc<Self>,
        key: ConnectionKey,
        params: McpServerParams,
        context: Option<ContextData>,
    ) -> OutboundResult<Arc<OutboundConnection>> {
        if let Some(existing) = self.connections.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let connection = Arc::new(OutboundConnection::new(key.clone(), params, context));
        self.connections
            .insert(key.clone(), Arc::clone(&connection));
        self.spawn_lifecycle(Arc::clone(&connection));
        info!(key = %key, "outbound connection created");
        Ok(connection)
    }

    /// Stop and forget a connection. Idempotent.
    pub async fn remove_one(&self, key: &ConnectionKey) {
        let Some((_, connection)) = self.connections.remove(key) else {
            return;
        };
        if let Some(task) = connection.lifecycle.lock().take() {
            task.abort();
        }
        let client = connection.client.write().take();
        if let Some(client) = client {
            client.shutdown().await;
        }
        connection.set_status(ConnectionStatus::Disconnected);
        info!(key = %key, "outbound connection removed");
    }

    /// Replace a connection's params and reconnect under the same key.
    pub async fn restart(
        self: &Arc<Self>,
        key: &ConnectionKey,
        new_params: McpServerParams,
    ) -> OutboundResult<Arc<OutboundConnection>> {
        let context = self
            .connections
            .get(key)
            .and_then(|c| c.context.read().clone());
        self.remove_one(key).await;
        self.create_keyed(key.clone(), new_params, context).await
    }

    /// Resolve a connection by logical name. With a session id, the
    /// per-client instance wins over the static entry. Hash-keyed template
    /// resolution needs the session index and lives in the resolver.
    pub fn get_by_name(
        &self,
        name: &str,
        session_id: Option<&str>,
    ) -> Option<Arc<OutboundConnection>> {
        if let Some(session_id) = session_id {
            let key = ConnectionKey::TemplateSession {
                name: name.to_string(),
                session_id: session_id.to_string(),
            };
            if let Some(found) = self.connections.get(&key) {
                return Some(Arc::clone(found.value()));
            }
        }
        self.connections
            .get(&ConnectionKey::Static(name.to_string()))
            .map(|c| Arc::clone(c.value()))
    }

    /// Fetch by exact key.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<OutboundConnection>> {
        self.connections.get(key).map(|c| Arc::clone(c.value()))
    }

    /// Read-only snapshot of the registry.
    pub fn snapshot(&self) -> HashMap<ConnectionKey, Arc<OutboundConnection>> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Serializable status of every connection, sorted by key.
    pub fn status_snapshot(&self) -> Vec<StatusSnapshot> {
        let mut out: Vec<StatusSnapshot> = self
            .connections
            .iter()
            .map(|entry| {
                let c = entry.value();
                StatusSnapshot {
                    key: c.key.to_string(),
                    name: c.name().to_string(),
                    status: c.status(),
                    tags: c.tags(),
                    last_error: c.last_error(),
                    authorization_url: c.authorization_url(),
                    last_connected: c.last_connected(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Complete a parked OAuth flow: exchange the code, rebuild the
    /// transport with the same provider, reconnect.
    pub async fn finish_oauth(
        self: &Arc<Self>,
        key: &ConnectionKey,
        authorization_code: &str,
    ) -> OutboundResult<()> {
        let connection = self
            .get(key)
            .ok_or_else(|| OutboundError::ClientNotFound(key.to_string()))?;

        if !connection.params.read().transport().is_network() {
            return Err(OutboundError::UnsupportedTransport(format!(
                "{key}: OAuth requires an HTTP transport"
            )));
        }
        if connection.status() != ConnectionStatus::AwaitingOAuth {
            return Err(OutboundError::connection(format!(
                "{key}: not awaiting authorization"
            )));
        }

        let provider = connection
            .oauth
            .read()
            .clone()
            .ok_or_else(|| OutboundError::connection(format!("{key}: no oauth provider")))?;
        provider.finish_auth(authorization_code).await?;

        // Old transport (if any) is gone with the old client; relaunch with
        // the now-authorized provider. Timeouts, tags, and params carry over.
        *connection.authorization_url.write() = None;
        *connection.last_error.write() = None;
        connection.set_status(ConnectionStatus::Connecting);
        self.spawn_lifecycle(connection);
        Ok(())
    }

    /// Stop everything; used at shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<ConnectionKey> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.remove_one(&key).await;
        }
    }

    fn spawn_lifecycle(self: &Arc<Self>, connection: Arc<OutboundConnection>) {
        let manager = Arc::clone(self);
        let task = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                manager.run_lifecycle(connection).await;
            })
        };
        // Supersede any previous lifecycle task (finish_oauth relaunch).
        if let Some(previous) = connection.lifecycle.lock().replace(task) {
            previous.abort();
        }
    }

    async fn run_lifecycle(self: Arc<Self>, connection: Arc<OutboundConnection>) {
        let key = connection.key.clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            connection.set_status(ConnectionStatus::Connecting);

            match self.connect_attempt(&connection).await {
                Ok(client) => {
                    *connection.client.write() = Some(Arc::clone(&client));
                    *connection.last_connected.write() = Some(Utc::now());
                    *connection.last_error.write() = None;
                    *connection.authorization_url.write() = None;
                    connection.set_status(ConnectionStatus::Connected);
                    info!(key = %key, "upstream connected");
                    self.emit_capabilities_event(&key);

                    client.wait_closed().await;

                    // Removed connections abort this task before landing here.
                    connection.client.write().take();
                    let restart = connection.params.read().restart_on_exit;
                    if restart {
                        warn!(key = %key, "upstream exited, restarting");
                        self.emit_capabilities_event(&key);
                        attempt = 0;
                        continue;
                    }
                    connection.set_status(ConnectionStatus::Disconnected);
                    debug!(key = %key, "upstream disconnected");
                    self.emit_capabilities_event(&key);
                    return;
                }
                Err(OutboundError::OAuthRequired { authorization_url }) => {
                    info!(key = %key, url = %authorization_url, "upstream requires authorization");
                    *connection.authorization_url.write() = Some(authorization_url);
                    connection.set_status(ConnectionStatus::AwaitingOAuth);
                    return; // never auto-retry
                }
                Err(e @ OutboundError::CircularDependency(_)) => {
                    warn!(key = %key, error = %e, "refusing circular upstream");
                    *connection.last_error.write() = Some(e.to_string());
                    connection.set_status(ConnectionStatus::Error);
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, error = %e, "connect failed, retrying");
                    *connection.last_error.write() = Some(e.to_string());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(key = %key, attempts = attempt, error = %e, "upstream connection failed");
                    *connection.last_error.write() = Some(e.to_string());
                    connection.set_status(ConnectionStatus::Error);
                    return;
                }
            }
        }
    }

    async fn connect_attempt(
        &self,
        connection: &Arc<OutboundConnection>,
    ) -> OutboundResult<Arc<McpClient>> {
        let params = connection.params.read().clone();
        let context = connection.context.read().clone();

        let (transport, oauth) = self.build_transport(connection, &params)?;
        *connection.oauth.write() = oauth;

        let connect_timeout = params
            .connection_timeout
            .map_or(self.config.connect_timeout, Duration::from_millis);
        tokio::time::timeout(connect_timeout, transport.connect())
            .await
            .map_err(|_| {
                OutboundError::timeout("connect", connect_timeout.as_millis() as u64)
            })??;

        let mut client_config = self.config.client.clone();
        if let Some(request_timeout) = params.request_timeout {
            client_config.request_timeout = Duration::from_millis(request_timeout);
        }

        // Bridge this connection's notifications into the manager fan-in.
        let (note_tx, mut note_rx) = mpsc::unbounded_channel();
        {
            let fan_in = self.notifications_tx.clone();
            let key = connection.key.clone();
            tokio::spawn(async move {
                while let Some(note) = note_rx.recv().await {
                    if fan_in.send((key.clone(), note)).is_err() {
                        break;
                    }
                }
            });
        }

        let client = McpClient::spawn(transport, client_config, note_tx);
        let init = match client.initialize(context.as_ref()).await {
            Ok(init) => init,
            Err(e) => {
                client.shutdown().await;
                return Err(e);
            }
        };

        if init.server_info.name == self.config.advertised_name {
            client.shutdown().await;
            return Err(OutboundError::CircularDependency(
                connection.name().to_string(),
            ));
        }

        Ok(client)
    }

    #[allow(clippy::type_complexity)]
    fn build_transport(
        &self,
        connection: &Arc<OutboundConnection>,
        params: &McpServerParams,
    ) -> OutboundResult<(Arc<dyn Transport>, Option<Arc<OAuthProvider>>)> {
        let connect_timeout = params
            .connection_timeout
            .map_or(self.config.connect_timeout, Duration::from_millis);

        match params.transport() {
            TransportKind::Stdio | TransportKind::StdioProxy => {
                let command = params
                    .command
                    .clone()
                    .ok_or_else(|| OutboundError::connection("stdio server without command"))?;
                let transport = ChildProcessTransport::new(ChildProcessConfig {
                    command,
                    args: params.args.clone(),
                    env: params.env.clone(),
                    cwd: params.cwd.clone(),
                    ..Default::default()
                });
                Ok((Arc::new(transport), None))
            }
            kind => {
                let url = params
                    .url
                    .clone()
                    .ok_or_else(|| OutboundError::connection("network server without url"))?;

                // Reuse the provider across rebuilds so a completed
                // authorization survives reconnects.
                let oauth = {
                    let existing = connection.oauth.read().clone();
                    match (existing, &params.oauth) {
                        (Some(provider), _) => Some(provider),
                        (None, Some(delegation)) => Some(Arc::new(OAuthProvider::new(
                            connection.name(),
                            delegation.clone(),
                        ))),
                        (None, None) => None,
                    }
                };

                let transport: Arc<dyn Transport> = if kind == TransportKind::Sse {
                    Arc::new(SseClientTransport::new(
                        SseClientConfig {
                            url,
                            headers: params.headers.clone(),
                            connect_timeout,
                        },
                        oauth.clone(),
                    ))
                } else {
                    Arc::new(StreamableClientTransport::new(
                        StreamableClientConfig {
                            url,
                            headers: params.headers.clone(),
                            connect_timeout,
                        },
                        oauth.clone(),
                    ))
                };
                Ok((transport, oauth))
            }
        }
    }

    fn emit_capabilities_event(&self, key: &ConnectionKey) {
        let _ = self
            .notifications_tx
            .send((key.clone(), JsonRpcNotification::new(CAPABILITIES_EVENT, None)));
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.config.base_delay.as_millis() as u64;
        let raw = base_ms.saturating_mul(1u64 << exponent);
        let capped = raw.min(self.config.max_delay.as_millis() as u64);
        // Full jitter in [0.5, 1.5) keeps a restarting fleet from thundering.
        let factor = rand::random_range(0.5..1.5);
        Duration::from_millis(((capped as f64) * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(400),
            client: ClientConfig {
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn stdio_params(command: &str) -> McpServerParams {
        serde_json::from_value(serde_json::json!({
            "command": command,
            "tags": ["test"]
        }))
        .unwrap()
    }

    async fn wait_for_status(
        connection: &Arc<OutboundConnection>,
        wanted: ConnectionStatus,
    ) -> bool {
        for _ in 0..100 {
            if connection.status() == wanted {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn missing_binary_lands_in_error() {
        let (manager, _notes) = OutboundManager::new(fast_config());
        let connection = manager
            .create_one("ghost", stdio_params("definitely-not-a-binary-qq"))
            .await
            .unwrap();
        assert!(wait_for_status(&connection, ConnectionStatus::Error).await);
        assert!(connection.last_error().is_some());
        assert!(connection.client().is_none());
    }

    #[tokio::test]
    async fn silent_upstream_times_out_to_error() {
        // `cat` echoes our own request back, which is not a response, so
        // initialize times out and the single attempt parks in Error.
        let (manager, _notes) = OutboundManager::new(fast_config());
        let connection = manager
            .create_one("mute", stdio_params("cat"))
            .await
            .unwrap();
        assert!(wait_for_status(&connection, ConnectionStatus::Error).await);
    }

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let (manager, _notes) = OutboundManager::new(fast_config());
        let a = manager
            .create_one("dup", stdio_params("cat"))
            .await
            .unwrap();
        let b = manager
            .create_one("dup", stdio_params("cat"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (manager, _notes) = OutboundManager::new(fast_config());
        let key = ConnectionKey::Static("gone".into());
        manager.remove_one(&key).await;
        manager
            .create_one("gone", stdio_params("cat"))
            .await
            .unwrap();
        manager.remove_one(&key).await;
        manager.remove_one(&key).await;
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn get_by_name_prefers_per_client_instance() {
        let (manager, _notes) = OutboundManager::new(fast_config());
        let session = unimcp_core::mint_session_id();
        manager
            .create_one("svc", stdio_params("cat"))
            .await
            .unwrap();
        manager
            .create_keyed(
                ConnectionKey::TemplateSession {
                    name: "svc".into(),
                    session_id: session.clone(),
                },
                stdio_params("cat"),
                None,
            )
            .await
            .unwrap();

        let hit = manager.get_by_name("svc", Some(&session)).unwrap();
        assert!(!hit.key.is_static());
        let hit = manager.get_by_name("svc", None).unwrap();
        assert!(hit.key.is_static());
        assert!(manager.get_by_name("nope", None).is_none());
    }

    #[tokio::test]
    async fn finish_oauth_on_stdio_is_unsupported() {
        let (manager, _notes) = OutboundManager::new(fast_config());
        manager
            .create_one("local", stdio_params("cat"))
            .await
            .unwrap();
        let err = manager
            .finish_oauth(&ConnectionKey::Static("local".into()), "code")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::UnsupportedTransport(_)));
    }

    #[tokio::test]
    async fn status_snapshot_is_sorted_and_complete() {
        let (manager, _notes) = OutboundManager::new(fast_config());
        manager.create_one("b", stdio_params("cat")).await.unwrap();
        manager.create_one("a", stdio_params("cat")).await.unwrap();
        let statuses = manager.status_snapshot();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].key, "a");
        assert_eq!(statuses[1].key, "b");
        assert_eq!(statuses[0].tags, vec!["test".to_string()]);
    }
}
