//! MCP wire types and JSON-RPC envelope for unimcp.
//!
//! The proxy consumes the MCP protocol as-is: these types mirror the wire
//! format faithfully (camelCase field names, optional fields omitted when
//! absent) so payloads relayed between downstream clients and upstream
//! servers survive a round-trip byte-for-byte at the JSON level.

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageId,
    error_codes,
};
pub use types::*;

/// Protocol revision the proxy speaks on both edges.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
