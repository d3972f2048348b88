//! The normalized Message Record and its collateral types.
//!
//! A [`MessageRecord`] is the single entity produced by both capture paths
//! (packet-level and stdio) and consumed by every downstream component:
//! storage, broadcast, analytics, and the query server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a captured message relative to the MCP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client -> server.
    Outgoing,
    /// Server -> client.
    Incoming,
    /// Direction could not be determined.
    Unknown,
}

impl Direction {
    /// Parse from the `direction` column's on-disk string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "outgoing" => Direction::Outgoing,
            "incoming" => Direction::Incoming,
            _ => Direction::Unknown,
        }
    }

    /// The on-disk/wire string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
            Direction::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The MCP transport a message was observed on.
///
/// `websocket` is intentionally absent: current MCP does not standardize a
/// WebSocket transport, and legacy WS-framed traffic is classified
/// [`TransportType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// Child-process stdin/stdout pipes.
    Stdio,
    /// Legacy two-endpoint HTTP+SSE transport.
    HttpSse,
    /// Single-endpoint Streamable HTTP transport.
    StreamableHttp,
    /// Classification could not be determined.
    #[default]
    Unknown,
}

impl TransportType {
    /// Parse from the on-disk string, normalizing anything unrecognized
    /// (including legacy `TCP/WS` and `TCP/Direct` values) to
    /// [`TransportType::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s {
            "stdio" => TransportType::Stdio,
            "http_sse" => TransportType::HttpSse,
            "streamable_http" => TransportType::StreamableHttp,
            _ => TransportType::Unknown,
        }
    }

    /// The on-disk/wire string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Stdio => "stdio",
            TransportType::HttpSse => "http_sse",
            TransportType::StreamableHttp => "streamable_http",
            TransportType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic classification of a JSON-RPC message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// `method` + `id` present.
    Request,
    /// `method` present, `id` absent.
    Notification,
    /// `result` + `id` present.
    Response,
    /// `error` + `id` present.
    Error,
    /// None of the above shapes matched.
    Unknown,
}

impl MessageType {
    /// The wire string representation, matching the `message_type` query
    /// filters used by C1/C8.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Notification => "notification",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a raw JSON-RPC message body.
///
/// This is a pure, total function: every input produces exactly one
/// [`MessageType`], including inputs that are not even valid JSON (treated
/// as [`MessageType::Unknown`]).
///
/// # Examples
///
/// ```
/// use mcphawk::record::{classify_message_type, MessageType};
///
/// assert_eq!(
///     classify_message_type(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#),
///     MessageType::Request
/// );
/// assert_eq!(
///     classify_message_type(r#"{"jsonrpc":"2.0","method":"notifications/x"}"#),
///     MessageType::Notification
/// );
/// ```
pub fn classify_message_type(message: &str) -> MessageType {
    let value: serde_json::Value = match serde_json::from_str(message) {
        Ok(v) => v,
        Err(_) => return MessageType::Unknown,
    };
    let obj = match value.as_object() {
        Some(o) => o,
        None => return MessageType::Unknown,
    };

    let has_method = obj.contains_key("method");
    let has_id = obj.contains_key("id");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if has_method && has_id {
        MessageType::Request
    } else if has_method && !has_id {
        MessageType::Notification
    } else if has_result && has_id {
        MessageType::Response
    } else if has_error && has_id {
        MessageType::Error
    } else {
        MessageType::Unknown
    }
}

/// Returns `true` if `message` parses as JSON and contains
/// `"jsonrpc":"2.0"`.
pub fn is_valid_jsonrpc(message: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(message) {
        Ok(serde_json::Value::Object(obj)) => {
            matches!(obj.get("jsonrpc"), Some(serde_json::Value::String(v)) if v == "2.0")
        }
        _ => false,
    }
}

/// Infer [`Direction`] from a JSON-RPC shape alone -- used for raw-TCP
/// extractions where no HTTP request/response framing is available to
/// disambiguate.
pub fn infer_direction_from_shape(message: &str) -> Direction {
    match classify_message_type(message) {
        MessageType::Request | MessageType::Notification => Direction::Outgoing,
        MessageType::Response | MessageType::Error => Direction::Incoming,
        MessageType::Unknown => Direction::Unknown,
    }
}

/// Discovered peer identity/version, populated from `initialize`
/// request/response bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordMetadata {
    /// `serverInfo.name` from an `initialize` response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// `serverInfo.version` from an `initialize` response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    /// `clientInfo.name` from an `initialize` request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// `clientInfo.version` from an `initialize` request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    /// The wrapped command line, for stdio records produced by [`crate::wrapper`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapped_command: Option<String>,
    /// The original stream name (`stdout`/`stderr`) for stdio records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// The URL advertised by an HTTP+SSE `event: endpoint` message, for
    /// records on a connection where that handshake was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

impl RecordMetadata {
    /// `true` if every field is `None` -- used to decide whether to persist
    /// `NULL` instead of an empty JSON object.
    pub fn is_empty(&self) -> bool {
        self == &RecordMetadata::default()
    }
}

/// Network peer identity for a captured message.
///
/// Network transports carry `(ip, port)`; stdio records carry a sentinel
/// `ip` string and a `pid` instead of ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// IP address, or a stdio sentinel (`"mcp-client"`, `"mcp-server"`, `"stdio"`).
    pub ip: String,
    /// TCP port; absent for stdio records.
    pub port: Option<u16>,
}

/// The normalized, immutable captured-message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Opaque unique identifier, assigned once at capture.
    pub log_id: String,
    /// Capture instant in UTC.
    pub timestamp: DateTime<Utc>,
    /// Source peer.
    pub src: Peer,
    /// Destination peer.
    pub dst: Peer,
    /// Process id, present only for stdio records.
    pub pid: Option<u32>,
    /// Message direction relative to the MCP client.
    pub direction: Direction,
    /// Transport the message was observed on.
    pub transport_type: TransportType,
    /// Raw JSON-RPC text exactly as observed.
    pub message: String,
    /// Discovered peer identity/context, if any.
    pub metadata: Option<RecordMetadata>,
}

impl MessageRecord {
    /// Classify this record's body.
    pub fn message_type(&self) -> MessageType {
        classify_message_type(&self.message)
    }

    /// Extract the JSON-RPC `method` field, if present.
    pub fn method(&self) -> Option<String> {
        serde_json::from_str::<serde_json::Value>(&self.message)
            .ok()
            .and_then(|v| v.get("method").and_then(|m| m.as_str()).map(str::to_string))
    }

    /// Extract the JSON-RPC `id` field as a canonical string, if present.
    ///
    /// JSON-RPC ids may be numbers or strings on the wire; this normalizes
    /// both to a `String` for use as a pairing key in [`crate::analytics`].
    pub fn id(&self) -> Option<String> {
        serde_json::from_str::<serde_json::Value>(&self.message)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .and_then(|id| match id {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// `true` if the body carries a top-level `error` field, regardless of
    /// [`MessageType`] classification. Error counts in analytics include
    /// both error-shaped records and any record whose body contains an
    /// `error` field.
    pub fn has_error_field(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.message)
            .ok()
            .and_then(|v| v.as_object().map(|o| o.contains_key("error")))
            .unwrap_or(false)
    }

    /// Validate JSON-RPC shape and the stdio/network peer-field split.
    /// Called by the store at insert time; violations surface as
    /// [`crate::error::McpHawkError::MalformedRecord`].
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_jsonrpc(&self.message) {
            return Err("message does not parse as JSON-RPC 2.0".to_string());
        }
        let is_stdio = self.transport_type == TransportType::Stdio;
        let has_ports = self.src.port.is_some() && self.dst.port.is_some();
        let has_pid = self.pid.is_some();
        if is_stdio {
            if has_ports {
                return Err("stdio record must not carry ports".to_string());
            }
            if !has_pid {
                return Err("stdio record must carry a pid".to_string());
            }
        } else if has_pid {
            return Err("non-stdio record must not carry a pid".to_string());
        }
        Ok(())
    }
}
