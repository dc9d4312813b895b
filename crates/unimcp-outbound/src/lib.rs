//! Outbound half of unimcp: everything between the proxy core and the
//! upstream MCP servers.
//!
//! The [`manager::OutboundManager`] owns the live fleet. Each upstream runs
//! behind an [`client::McpClient`] over one of the [`transport`]
//! implementations; the manager drives the per-connection lifecycle state
//! machine (retry with backoff, OAuth interception, circular-dependency
//! guard) and publishes read-only snapshots. The [`resolver`] maps logical
//! server names to live connections without exposing the key scheme.

pub mod client;
pub mod error;
pub mod key;
pub mod manager;
pub mod oauth;
pub mod resolver;
pub mod sse;
pub mod stdio;
pub mod streamable;
pub mod transport;

pub use client::{ClientConfig, McpClient};
pub use error::{OutboundError, OutboundResult};
pub use key::ConnectionKey;
pub use manager::{
    CAPABILITIES_EVENT, ConnectionStatus, ManagerConfig, OutboundConnection, OutboundManager,
    StatusSnapshot, UpstreamNotification,
};
pub use oauth::OAuthProvider;
pub use resolver::{ConnectionResolver, SessionTemplateIndex};
pub use transport::Transport;
