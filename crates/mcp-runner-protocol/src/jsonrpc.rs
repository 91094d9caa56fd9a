//! JSON-RPC 2.0 envelope as used by the MCP stdio transport.
//!
//! Every line an MCP server writes to stdout is expected to be one of these
//! messages. Anything that does not parse is treated as log output by the
//! runner.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved method name for liveness pings.
pub const PING_METHOD: &str = "ping";

/// Prefix of request ids generated by the runner for its own pings.
///
/// Responses carrying such an id are answers to runner pings and never reach
/// session listeners.
pub const PING_ID_PREFIX: &str = "mcp-runner/ping/";

// ============================================================================
// Primitive types
// ============================================================================

/// The `"jsonrpc": "2.0"` marker. Any other value fails deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value == JSONRPC_VERSION {
            Ok(Version)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version '{value}'"
            )))
        }
    }
}

/// Request identifier: JSON-RPC allows numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Whether this id was minted by the runner for one of its own pings.
    pub fn is_internal_ping(&self) -> bool {
        matches!(self, RequestId::String(id) if id.starts_with(PING_ID_PREFIX))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub jsonrpc: Version,
    /// `null` when the request id could not be determined.
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

/// Any JSON-RPC message.
///
/// Variant order matters for untagged matching: a request must be tried
/// before a notification since both carry `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

impl JsonRpcMessage {
    /// Parse a single line of container output.
    ///
    /// Returns `None` for anything that is not a JSON-RPC message.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// A ping request that must be answered by whoever receives it.
    pub fn is_ping_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(r) if r.method == PING_METHOD)
    }

    /// A message correlated with a ping the runner sent itself.
    pub fn is_internal_ping(&self) -> bool {
        self.id().is_some_and(RequestId::is_internal_ping)
    }

    pub fn ping_request(id: impl Into<RequestId>) -> Self {
        JsonRpcMessage::Request(Request {
            jsonrpc: Version,
            id: id.into(),
            method: PING_METHOD.to_string(),
            params: None,
        })
    }

    /// Empty-result response to a ping, as mandated by MCP.
    pub fn ping_response(id: RequestId) -> Self {
        JsonRpcMessage::Response(Response {
            jsonrpc: Version,
            id,
            result: Value::Object(Default::default()),
        })
    }
}

/// One message or a JSON-RPC batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBatch {
    One(JsonRpcMessage),
    Many(Vec<JsonRpcMessage>),
}

impl MessageBatch {
    pub fn into_vec(self) -> Vec<JsonRpcMessage> {
        match self {
            MessageBatch::One(message) => vec![message],
            MessageBatch::Many(messages) => messages,
        }
    }
}
