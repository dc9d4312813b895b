//! The outbound transport abstraction.
//!
//! Transports move opaque JSON-RPC frames; the [`crate::client::McpClient`]
//! above them owns correlation and protocol state. Implementations are
//! message-based: `send` accepts one serialized frame, `receive` yields the
//! next inbound frame or `None` once the peer is gone.

use std::sync::Arc;

use async_trait::async_trait;
use unimcp_config::TransportKind;

use crate::error::OutboundResult;
use crate::oauth::OAuthProvider;

/// An established or establishable link to one upstream server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the link up. Idempotent once connected.
    async fn connect(&self) -> OutboundResult<()>;

    /// Send one serialized JSON-RPC frame.
    async fn send(&self, frame: String) -> OutboundResult<()>;

    /// Receive the next inbound frame; `None` means the link closed.
    ///
    /// Single-consumer: the owning client's reader task is the only caller.
    async fn receive(&self) -> OutboundResult<Option<String>>;

    /// Tear the link down. Idempotent.
    async fn close(&self) -> OutboundResult<()>;

    /// Which transport family this is.
    fn kind(&self) -> TransportKind;

    /// OAuth delegation hook, present on transports that can carry one.
    fn oauth_provider(&self) -> Option<Arc<OAuthProvider>> {
        None
    }
}
