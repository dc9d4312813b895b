//! The inbound half of unimcp and its control plane.
//!
//! Downstream clients connect over stdio, legacy SSE, or streamable HTTP;
//! each session gets its own MCP server instance whose handlers consult
//! the aggregator and connection resolver. The reload engine watches the
//! config snapshot and restarts the minimal set of upstreams; the session
//! factory materializes templates per client.

pub mod dispatch;
pub mod error;
pub mod factory;
pub mod http;
pub mod reload;
pub mod runtime;
pub mod session;
pub mod stdio;

pub use error::{ProxyError, ProxyResult};
pub use runtime::{Runtime, RuntimeOptions};
pub use session::{
    InboundSession, InboundTransport, SessionFilter, SessionService, SessionStatus, TagFilterMode,
};
