//! Inbound stdio transport: one process-wide session, no auth.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use unimcp_protocol::jsonrpc::JsonRpcMessage;
use unimcp_template::ContextData;

use crate::dispatch;
use crate::error::ProxyResult;
use crate::runtime::Runtime;
use crate::session::{InboundTransport, SessionFilter, SessionOptions};

/// Fixed session id for the stdio transport.
pub const STDIO_SESSION_ID: &str = "stdio";

/// Serve MCP over stdin/stdout until EOF.
pub async fn run(runtime: Arc<Runtime>) -> ProxyResult<()> {
    let session = runtime
        .sessions
        .open_session(SessionOptions {
            transport: InboundTransport::Stdio,
            filter: SessionFilter::none(),
            enable_pagination: runtime.snapshot.load().features.pagination,
            context: ContextData::default(),
            fixed_id: Some(STDIO_SESSION_ID.to_string()),
        })
        .await;

    // All output (responses and notifications) flows through the session
    // channel so one writer owns stdout and ordering holds.
    let mut frames = session.attach_channel();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = frames.recv().await {
            let line = frame.to_string();
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = match JsonRpcMessage::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable frame on stdin");
                continue;
            }
        };
        if let Some(response) = dispatch::handle_message(&runtime, &session, message).await {
            match serde_json::to_value(&response) {
                Ok(frame) => session.send_frame(frame),
                Err(e) => warn!(error = %e, "unserializable response"),
            }
        }
    }

    debug!("stdin closed, shutting down stdio session");
    runtime.factory.detach_session(STDIO_SESSION_ID).await;
    runtime.sessions.delete_session(STDIO_SESSION_ID).await;
    session.detach_channel();
    writer.abort();
    Ok(())
}
