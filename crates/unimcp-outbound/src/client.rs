//! The outbound MCP client.
//!
//! One client per upstream connection. A reader task owns the transport's
//! inbound side: responses are correlated to pending requests by id,
//! notifications are forwarded to the owner (debounced for the three
//! list-changed methods), and server-initiated requests are answered with
//! `method not found`; the proxy does not relay sampling to downstreams.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

use unimcp_protocol::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageId,
};
use unimcp_protocol::types::methods;
use unimcp_protocol::{
    Implementation, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, LoggingLevel, PROTOCOL_VERSION,
};
use unimcp_template::ContextData;

use crate::error::{OutboundError, OutboundResult};
use crate::transport::Transport;

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name the proxy announces as `clientInfo.name`.
    pub client_name: String,
    pub client_version: String,
    /// Per-call deadline.
    pub request_timeout: Duration,
    /// Suppression window for repeated list-changed notifications.
    pub notification_debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "unimcp".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(15),
            notification_debounce: Duration::from_millis(300),
        }
    }
}

/// The three methods constructed as debounced on every upstream client.
const DEBOUNCED_METHODS: [&str; 3] = [
    methods::TOOLS_LIST_CHANGED,
    methods::RESOURCES_LIST_CHANGED,
    methods::PROMPTS_LIST_CHANGED,
];

/// An initialized MCP client over some transport.
pub struct McpClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    next_id: AtomicI64,
    pending: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    server_info: RwLock<Option<Implementation>>,
    instructions: RwLock<Option<String>>,
    closed: Arc<AtomicBool>,
    closed_notify: Arc<Notify>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpClient {
    /// Wrap a connected transport and start the reader task.
    ///
    /// `notifications` receives upstream notifications the owner cares
    /// about (list-changed, log messages), already debounced.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        notifications: mpsc::UnboundedSender<JsonRpcNotification>,
    ) -> Arc<Self> {
        let pending: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let closed_notify = Arc::new(Notify::new());

        let reader = {
            let transport = Arc::clone(&transport);
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let closed_notify = Arc::clone(&closed_notify);
            let debounce = config.notification_debounce;
            tokio::spawn(async move {
                let mut last_emitted: HashMap<String, Instant> = HashMap::new();
                loop {
                    let frame = match transport.receive().await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "transport receive failed");
                            break;
                        }
                    };
                    match JsonRpcMessage::from_str(&frame) {
                        Ok(JsonRpcMessage::Response(response)) => {
                            if let MessageId::Number(id) = &response.id {
                                if let Some((_, tx)) = pending.remove(id) {
                                    let _ = tx.send(response);
                                    continue;
                                }
                            }
                            debug!(id = %response.id, "response with no pending request");
                        }
                        Ok(JsonRpcMessage::Notification(note)) => {
                            let is_debounced = DEBOUNCED_METHODS.contains(&note.method.as_str());
                            if is_debounced {
                                let now = Instant::now();
                                if let Some(last) = last_emitted.get(&note.method) {
                                    if now.duration_since(*last) < debounce {
                                        continue;
                                    }
                                }
                                last_emitted.insert(note.method.clone(), now);
                            }
                            if notifications.send(note).is_err() {
                                break;
                            }
                        }
                        Ok(JsonRpcMessage::Request(request)) => {
                            // Server-initiated requests are out of contract.
                            let response = JsonRpcResponse::error(
                                request.id,
                                JsonRpcError::method_not_found(&request.method),
                            );
                            if let Ok(raw) = serde_json::to_string(&response) {
                                let _ = transport.send(raw).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable frame from upstream");
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                closed_notify.notify_waiters();
                // Fail everything still in flight.
                pending.clear();
            })
        };

        Arc::new(Self {
            transport,
            config,
            next_id: AtomicI64::new(1),
            pending,
            server_info: RwLock::new(None),
            instructions: RwLock::new(None),
            closed,
            closed_notify,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// True once the transport's inbound side has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve when the connection closes.
    pub async fn wait_closed(&self) {
        loop {
            // Register before checking so a notify between check and await
            // cannot be missed.
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Upstream-reported identity, after `initialize`.
    pub fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().clone()
    }

    /// Upstream-provided usage instructions, after `initialize`.
    pub fn instructions(&self) -> Option<String> {
        self.instructions.read().clone()
    }

    /// Issue one request and await its response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> OutboundResult<Value> {
        if self.is_closed() {
            return Err(OutboundError::transport("connection closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // The deadline covers the send too; a wedged transport must not
        // hang the caller.
        let timeout = self.config.request_timeout;
        let raw = serde_json::to_string(&request)?;
        let exchange = async {
            self.transport.send(raw).await?;
            rx.await
                .map_err(|_| OutboundError::transport("connection closed mid-request"))
        };
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.pending.remove(&id);
                return Err(e);
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(OutboundError::timeout(method, timeout.as_millis() as u64));
            }
        };

        match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (_, Some(error)) => Err(OutboundError::Upstream {
                code: error.code,
                message: error.message,
            }),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Fire a notification; no response expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> OutboundResult<()> {
        let note = JsonRpcNotification::new(method, params);
        self.transport.send(serde_json::to_string(&note)?).await
    }

    /// Perform the MCP handshake. `context` is carried to the upstream via
    /// `_meta.context` so template-materialized servers see their session.
    pub async fn initialize(
        &self,
        context: Option<&ContextData>,
    ) -> OutboundResult<InitializeResult> {
        let mut params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
        });
        if let Some(context) = context {
            params["_meta"] = serde_json::json!({ "context": context });
        }

        let raw = self.call(methods::INITIALIZE, Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| OutboundError::SchemaValidation(format!("initialize result: {e}")))?;

        *self.server_info.write() = Some(result.server_info.clone());
        *self.instructions.write() = result.instructions.clone();

        self.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    /// `tools/list`, optionally resuming from an upstream cursor.
    pub async fn list_tools(&self, cursor: Option<String>) -> OutboundResult<ListToolsResult> {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let raw = self.call(methods::TOOLS_LIST, params).await?;
        serde_json::from_value(raw)
            .map_err(|e| OutboundError::SchemaValidation(format!("tools/list result: {e}")))
    }

    /// `tools/call`; the result is relayed opaquely.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> OutboundResult<Value> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::to_value(arguments)?;
        }
        self.call(methods::TOOLS_CALL, Some(params)).await
    }

    /// `resources/list`.
    pub async fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> OutboundResult<ListResourcesResult> {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let raw = self.call(methods::RESOURCES_LIST, params).await?;
        serde_json::from_value(raw)
            .map_err(|e| OutboundError::SchemaValidation(format!("resources/list result: {e}")))
    }

    /// `resources/templates/list`.
    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> OutboundResult<ListResourceTemplatesResult> {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let raw = self.call(methods::RESOURCES_TEMPLATES_LIST, params).await?;
        serde_json::from_value(raw).map_err(|e| {
            OutboundError::SchemaValidation(format!("resources/templates/list result: {e}"))
        })
    }

    /// `resources/read`; the contents are relayed opaquely.
    pub async fn read_resource(&self, uri: &str) -> OutboundResult<Value> {
        self.call(
            methods::RESOURCES_READ,
            Some(serde_json::json!({ "uri": uri })),
        )
        .await
    }

    /// `prompts/list`.
    pub async fn list_prompts(&self, cursor: Option<String>) -> OutboundResult<ListPromptsResult> {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let raw = self.call(methods::PROMPTS_LIST, params).await?;
        serde_json::from_value(raw)
            .map_err(|e| OutboundError::SchemaValidation(format!("prompts/list result: {e}")))
    }

    /// `prompts/get`; the messages are relayed opaquely.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> OutboundResult<Value> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::to_value(arguments)?;
        }
        self.call(methods::PROMPTS_GET, Some(params)).await
    }

    /// `logging/setLevel` on the upstream.
    pub async fn set_level(&self, level: LoggingLevel) -> OutboundResult<()> {
        self.call(
            methods::LOGGING_SET_LEVEL,
            Some(serde_json::json!({ "level": level })),
        )
        .await
        .map(|_| ())
    }

    /// Close the transport and stop the reader.
    pub async fn shutdown(&self) {
        let _ = self.transport.close().await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;
    use unimcp_config::TransportKind;

    /// In-memory transport: scripted responses keyed by method.
    struct ScriptedTransport {
        inbound_tx: mpsc::Sender<String>,
        inbound_rx: TokioMutex<mpsc::Receiver<String>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            let (inbound_tx, inbound_rx) = mpsc::channel(64);
            Self {
                inbound_tx,
                inbound_rx: TokioMutex::new(inbound_rx),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> OutboundResult<()> {
            Ok(())
        }

        async fn send(&self, frame: String) -> OutboundResult<()> {
            let parsed: Value = serde_json::from_str(&frame).unwrap();
            self.sent.lock().push(frame);
            // Answer requests; swallow notifications.
            if let (Some(id), Some(method)) = (parsed.get("id"), parsed.get("method")) {
                let result = match method.as_str().unwrap() {
                    "initialize" => serde_json::json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "scripted", "version": "1.0"},
                        "instructions": "be nice"
                    }),
                    "tools/list" => serde_json::json!({
                        "tools": [{"name": "echo", "inputSchema": {"type": "object"}}]
                    }),
                    "tools/call" => serde_json::json!({"content": [{"type": "text", "text": "ok"}]}),
                    _ => Value::Null,
                };
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result,
                });
                let _ = self.inbound_tx.send(response.to_string()).await;
            }
            Ok(())
        }

        async fn receive(&self) -> OutboundResult<Option<String>> {
            Ok(self.inbound_rx.lock().await.recv().await)
        }

        async fn close(&self) -> OutboundResult<()> {
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::StreamableHttp
        }
    }

    fn client_with(
        transport: Arc<ScriptedTransport>,
    ) -> (Arc<McpClient>, mpsc::UnboundedReceiver<JsonRpcNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = McpClient::spawn(transport, ClientConfig::default(), tx);
        (client, rx)
    }

    #[tokio::test]
    async fn initialize_captures_identity_and_sends_initialized() {
        let transport = Arc::new(ScriptedTransport::new());
        let (client, _rx) = client_with(Arc::clone(&transport));

        let result = client.initialize(None).await.unwrap();
        assert_eq!(result.server_info.name, "scripted");
        assert_eq!(client.server_info().unwrap().name, "scripted");
        assert_eq!(client.instructions().as_deref(), Some("be nice"));

        let sent = transport.sent.lock().clone();
        assert!(sent.iter().any(|f| f.contains("notifications/initialized")));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn initialize_carries_context_in_meta() {
        let transport = Arc::new(ScriptedTransport::new());
        let (client, _rx) = client_with(Arc::clone(&transport));

        let context = ContextData {
            project: serde_json::json!({"name": "alpha"}),
            ..Default::default()
        };
        client.initialize(Some(&context)).await.unwrap();

        let sent = transport.sent.lock().clone();
        let init = sent.iter().find(|f| f.contains("\"initialize\"")).unwrap();
        let parsed: Value = serde_json::from_str(init).unwrap();
        assert_eq!(
            parsed["params"]["_meta"]["context"]["project"]["name"],
            "alpha"
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn list_and_call_round_trip() {
        let transport = Arc::new(ScriptedTransport::new());
        let (client, _rx) = client_with(transport);

        let tools = client.list_tools(None).await.unwrap();
        assert_eq!(tools.tools.len(), 1);
        assert_eq!(tools.tools[0].name, "echo");

        let result = client.call_tool("echo", None).await.unwrap();
        assert_eq!(result["content"][0]["text"], "ok");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn list_changed_notifications_debounce() {
        let transport = Arc::new(ScriptedTransport::new());
        let inbound = transport.inbound_tx.clone();
        let (client, mut rx) = client_with(transport);

        let note =
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"})
                .to_string();
        for _ in 0..5 {
            inbound.send(note.clone()).await.unwrap();
        }
        // Give the reader a beat to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1, "burst should collapse to one notification");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn upstream_error_is_relayed() {
        struct ErrorTransport {
            inbound_tx: mpsc::Sender<String>,
            inbound_rx: TokioMutex<mpsc::Receiver<String>>,
        }

        #[async_trait]
        impl Transport for ErrorTransport {
            async fn connect(&self) -> OutboundResult<()> {
                Ok(())
            }
            async fn send(&self, frame: String) -> OutboundResult<()> {
                let parsed: Value = serde_json::from_str(&frame).unwrap();
                if let Some(id) = parsed.get("id") {
                    let response = serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32000, "message": "tool exploded"}
                    });
                    let _ = self.inbound_tx.send(response.to_string()).await;
                }
                Ok(())
            }
            async fn receive(&self) -> OutboundResult<Option<String>> {
                Ok(self.inbound_rx.lock().await.recv().await)
            }
            async fn close(&self) -> OutboundResult<()> {
                Ok(())
            }
            fn kind(&self) -> TransportKind {
                TransportKind::StreamableHttp
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let transport = Arc::new(ErrorTransport {
            inbound_tx,
            inbound_rx: TokioMutex::new(inbound_rx),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = McpClient::spawn(transport, ClientConfig::default(), tx);

        let err = client.call_tool("boom", None).await.unwrap_err();
        match err {
            OutboundError::Upstream { code, message } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "tool exploded");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        client.shutdown().await;
    }
}
