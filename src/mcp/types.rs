//! MCP 2025-11-25 protocol types and JSON-RPC 2.0 primitives
//!
//! Covers the subset of the Model Context Protocol the query server (C8)
//! needs: the JSON-RPC envelope, server identity/capabilities, and tool
//! definition/call/response types. All types derive `Debug`, `Clone`,
//! `Serialize`, and `Deserialize` unless noted otherwise. Struct fields are
//! `camelCase` on the wire via `#[serde(rename_all = "camelCase")]` unless
//! already camelCase or a `_meta` override is required. `Option<>` fields
//! omit their key from JSON when `None` via
//! `#[serde(skip_serializing_if = "Option::is_none")]`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The protocol revision this server speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 wire types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request object.
///
/// `jsonrpc` MUST always be `"2.0"`. `id` is `None` only for notifications.
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::JsonRpcRequest;
///
/// let req = JsonRpcRequest {
///     jsonrpc: "2.0".to_string(),
///     id: Some(serde_json::json!(1)),
///     method: "ping".to_string(),
///     params: None,
/// };
/// assert_eq!(req.jsonrpc, "2.0");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Request correlation identifier. Present for requests, absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 response object.
///
/// Exactly one of `result` or `error` will be present in a valid response.
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::JsonRpcResponse;
///
/// let resp = JsonRpcResponse {
///     jsonrpc: "2.0".to_string(),
///     id: Some(serde_json::json!(1)),
///     result: Some(serde_json::json!({})),
///     error: None,
/// };
/// assert!(resp.result.is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Mirrors the `id` from the corresponding request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Successful result value; mutually exclusive with `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error object; mutually exclusive with `result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::JsonRpcError;
///
/// let e = JsonRpcError { code: -32600, message: "Invalid Request".to_string(), data: None };
/// assert_eq!(e.to_string(), "JSON-RPC error -32600: Invalid Request");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code as defined by JSON-RPC 2.0 or the MCP spec.
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
    /// Optional additional error context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 notification (a request with no `id`).
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::JsonRpcNotification;
///
/// let n = JsonRpcNotification {
///     jsonrpc: "2.0".to_string(),
///     method: "notifications/initialized".to_string(),
///     params: None,
/// };
/// assert_eq!(n.method, "notifications/initialized");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// The notification method name.
    pub method: String,
    /// Optional notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Identity and capability types
// ---------------------------------------------------------------------------

/// Identifies a client or server implementation by name and version.
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::Implementation;
///
/// let info = Implementation {
///     name: "mcphawk".to_string(),
///     version: "0.1.0".to_string(),
///     description: None,
/// };
/// let json = serde_json::to_string(&info).unwrap();
/// assert!(!json.contains("description"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Short name of the implementation (e.g. `"mcphawk"`).
    pub name: String,
    /// Semantic version string (e.g. `"0.1.0"`).
    pub version: String,
    /// Optional human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The full set of capabilities that a server advertises to a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Experimental capability extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
    /// Server exposes tools via `tools/list` and `tools/call`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Initialize types
// ---------------------------------------------------------------------------

/// Parameters sent by the client in the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// The protocol version the client wishes to use.
    pub protocol_version: String,
    /// Information identifying this client implementation.
    pub client_info: Implementation,
}

/// Response returned by the server to an `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// The protocol version the server has selected for this session.
    pub protocol_version: String,
    /// Capabilities advertised by this server.
    pub capabilities: ServerCapabilities,
    /// Information identifying this server implementation.
    pub server_info: Implementation,
}

// ---------------------------------------------------------------------------
// Tool types
// ---------------------------------------------------------------------------

/// A tool exposed by an MCP server.
///
/// Named `McpTool` to avoid a naming collision with transport-layer types.
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::McpTool;
///
/// let tool = McpTool {
///     name: "search".to_string(),
///     description: Some("Search the web".to_string()),
///     input_schema: serde_json::json!({ "type": "object" }),
/// };
/// assert_eq!(tool.name, "search");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    /// Unique name of the tool within the server.
    pub name: String,
    /// Human-readable description of the tool's purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the tool's input parameters.
    pub input_schema: serde_json::Value,
}

/// Response to a `tools/list` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResponse {
    /// Tools in this page of results.
    pub tools: Vec<McpTool>,
    /// Opaque cursor for the next page; `None` means this is the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Optional extension metadata.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Parameters for a `tools/call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments to pass to the tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Response from a `tools/call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResponse {
    /// The content items produced by the tool.
    pub content: Vec<ToolResponseContent>,
    /// When `true`, the tool signalled an error condition within its content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Structured output matching the tool's logical result shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
}

/// A single content item in a tool response.
///
/// Discriminated by the `"type"` field on the wire. Only the `text` variant
/// is produced by this server; the others exist for wire compatibility.
///
/// # Examples
///
/// ```
/// use mcphawk::mcp::types::ToolResponseContent;
///
/// let c = ToolResponseContent::Text { text: "hello".to_string() };
/// let json = serde_json::to_value(&c).unwrap();
/// assert_eq!(json["type"], "text");
/// assert_eq!(json["text"], "hello");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolResponseContent {
    /// Plain text output.
    Text {
        /// The text content.
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonrpc_request_round_trips() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(7)),
            method: "tools/list".to_string(),
            params: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        let back: JsonRpcRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.method, "tools/list");
        assert_eq!(back.id, Some(serde_json::json!(7)));
    }

    #[test]
    fn test_jsonrpc_request_omits_absent_id() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "notifications/initialized".to_string(),
            params: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_jsonrpc_error_display() {
        let e = JsonRpcError { code: -32601, message: "Method not found".to_string(), data: None };
        assert_eq!(e.to_string(), "JSON-RPC error -32601: Method not found");
    }

    #[test]
    fn test_call_tool_response_serializes_text_content() {
        let resp = CallToolResponse {
            content: vec![ToolResponseContent::Text { text: "ok".to_string() }],
            is_error: None,
            structured_content: Some(serde_json::json!({ "count": 1 })),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert!(json.get("isError").is_none());
    }

    #[test]
    fn test_server_capabilities_default_is_empty_object() {
        let caps = ServerCapabilities::default();
        assert_eq!(serde_json::to_value(&caps).unwrap(), serde_json::json!({}));
    }
}
