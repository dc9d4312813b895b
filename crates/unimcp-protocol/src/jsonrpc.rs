//! JSON-RPC 2.0 envelope types.
//!
//! Requests, responses, and notifications share one `jsonrpc: "2.0"` frame.
//! Responses carry exactly one of `result` or `error`; the serde shapes here
//! enforce that when constructing, and tolerate it when parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only protocol version this module speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and implementation-defined JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Request timed out before the upstream answered.
    pub const REQUEST_TIMEOUT: i32 = -32001;
    /// Referenced server or capability is not known to the proxy.
    pub const NOT_FOUND: i32 = -32002;
}

/// A JSON-RPC message id. The wire allows strings and integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// String-typed id
    String(String),
    /// Integer-typed id
    Number(i64),
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A request expecting a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Request id, echoed in the response
    pub id: MessageId,
    /// Method name, e.g. `tools/list`
    pub method: String,
    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with the given id, method, and params.
    pub fn new(id: impl Into<MessageId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A notification: a request with no id and no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Method name, e.g. `notifications/tools/list_changed`
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Build a notification for `method`.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error payload inside a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code (see [`error_codes`])
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Build an error with code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32601` for an unknown method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// `-32602` with the given message.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    /// `-32603` with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

/// A response carrying either a result or an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Id of the request being answered
    pub id: MessageId,
    /// Success payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: MessageId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: MessageId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// True when the response carries an error payload.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Any inbound frame: request, notification, or response.
///
/// Transports hand these to the dispatch layer, which routes by variant.
/// Order matters for untagged deserialization: a request is also a valid
/// notification shape plus an id, so `Request` is tried first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// A request (has `id` and `method`)
    Request(JsonRpcRequest),
    /// A response (has `id`, no `method`)
    Response(JsonRpcResponse),
    /// A notification (has `method`, no `id`)
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Parse a frame from raw JSON text.
    pub fn from_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_round_trip() {
        let req = JsonRpcRequest::new(7, "tools/list", Some(serde_json::json!({"cursor": "abc"})));
        let raw = serde_json::to_string(&req).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.method, "tools/list");
        assert_eq!(back.id, MessageId::Number(7));
    }

    #[test]
    fn message_variant_routing() {
        let req: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let note: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(note, JsonRpcMessage::Notification(_)));

        let resp: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn error_response_shape() {
        let resp = JsonRpcResponse::error(
            MessageId::Number(3),
            JsonRpcError::method_not_found("bogus/method"),
        );
        assert!(resp.is_error());
        let raw = serde_json::to_string(&resp).unwrap();
        assert!(!raw.contains("\"result\""));
        assert!(raw.contains("-32601"));
    }

    #[test]
    fn string_and_numeric_ids() {
        let a: MessageId = serde_json::from_str("42").unwrap();
        assert_eq!(a, MessageId::Number(42));
        let b: MessageId = serde_json::from_str(r#""req-1""#).unwrap();
        assert_eq!(b, MessageId::String("req-1".into()));
    }
}
