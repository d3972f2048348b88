//! The query server: exposes the message store as MCP tools over stdio or
//! Streamable HTTP (C8).

use crate::analytics::{AnalyticsEngine, Window};
use crate::error::{jsonrpc_codes, Result};
use crate::mcp::types::{
    CallToolParams, CallToolResponse, Implementation, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ListToolsResponse, McpTool, ServerCapabilities, ToolResponseContent,
};
use crate::record::TransportType;
use crate::store::MessageStore;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

const PROTOCOL_VERSION: &str = "2025-11-25";
const DEFAULT_QUERY_LIMIT: usize = 50;

/// Header carrying the Streamable HTTP session id. MCP leaves the header's
/// name implementation-chosen; this one follows the reference transport's
/// own convention.
const SESSION_HEADER: &str = "mcp-session-id";

/// Dispatches the five read-only tools this server exposes over a
/// [`MessageStore`], independent of which transport carries the request.
///
/// Session ids are only meaningful over Streamable HTTP, where each request
/// arrives on its own connection with no other way to correlate it to a
/// prior `initialize`; stdio's single persistent pipe has no such ambiguity
/// and never allocates one.
pub struct QueryServer {
    store: Arc<MessageStore>,
    sessions: Mutex<HashSet<String>>,
}

impl QueryServer {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store, sessions: Mutex::new(HashSet::new()) }
    }

    fn open_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().unwrap().insert(id.clone());
        id
    }

    fn session_is_valid(&self, session_id: Option<&str>) -> bool {
        match session_id {
            Some(id) => self.sessions.lock().unwrap().contains(id),
            None => false,
        }
    }

    fn tool_catalog() -> Vec<McpTool> {
        vec![
            McpTool {
                name: "query_traffic".to_string(),
                description: Some("Return recent captured MCP messages, newest first.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "limit": {"type": "integer", "minimum": 1, "maximum": 1000},
                        "offset": {"type": "integer", "minimum": 0}
                    }
                }),
            },
            McpTool {
                name: "get_log".to_string(),
                description: Some("Look up one captured message by its log_id.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"log_id": {"type": "string"}},
                    "required": ["log_id"]
                }),
            },
            McpTool {
                name: "search_traffic".to_string(),
                description: Some(
                    "Search captured messages by substring, message type, and/or transport."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "search_term": {"type": "string"},
                        "message_type": {"type": "string"},
                        "transport_type": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1, "maximum": 1000}
                    }
                }),
            },
            McpTool {
                name: "get_stats".to_string(),
                description: Some(
                    "Summary counts: total messages, distinct methods, transport breakdown."
                        .to_string(),
                ),
                input_schema: json!({"type": "object", "properties": {}}),
            },
            McpTool {
                name: "list_methods".to_string(),
                description: Some("Every distinct JSON-RPC method name seen so far.".to_string()),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        ]
    }

    fn call_tool(&self, params: &CallToolParams) -> Result<CallToolResponse> {
        let args = params.arguments.clone().unwrap_or(Value::Null);
        let result = match params.name.as_str() {
            "query_traffic" => self.query_traffic(&args),
            "get_log" => self.get_log(&args),
            "search_traffic" => self.search_traffic(&args),
            "get_stats" => self.get_stats(),
            "list_methods" => self.list_methods(),
            other => {
                return Ok(error_tool_response(format!("unknown tool: {other}")));
            }
        };

        match result {
            Ok(value) => Ok(CallToolResponse {
                content: vec![ToolResponseContent::Text { text: value.to_string() }],
                is_error: None,
                structured_content: Some(value),
            }),
            Err(e) => Ok(error_tool_response(e.to_string())),
        }
    }

    fn query_traffic(&self, args: &Value) -> Result<Value> {
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(DEFAULT_QUERY_LIMIT as u64) as usize;
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let records = self.store.fetch_page(limit, offset)?;
        Ok(json!({ "count": records.len(), "records": records }))
    }

    fn get_log(&self, args: &Value) -> Result<Value> {
        let log_id = args
            .get("log_id")
            .and_then(Value::as_str)
            .ok_or_else(|| crate::error::McpHawkError::ClientError("log_id is required".to_string()))?;
        match self.store.get_by_id(log_id)? {
            Some(record) => Ok(json!(record)),
            None => Ok(Value::Null),
        }
    }

    fn search_traffic(&self, args: &Value) -> Result<Value> {
        let search_term = args.get("search_term").and_then(Value::as_str).unwrap_or("");
        let message_type = args.get("message_type").and_then(Value::as_str);
        let transport_type = args
            .get("transport_type")
            .and_then(Value::as_str)
            .map(TransportType::parse);
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(DEFAULT_QUERY_LIMIT as u64) as usize;

        let records = self.store.search(search_term, message_type, transport_type, limit)?;
        Ok(json!({ "count": records.len(), "records": records }))
    }

    fn get_stats(&self) -> Result<Value> {
        let total = self.store.count()?;
        let unique_methods = self.store.unique_methods()?;
        let analytics = AnalyticsEngine::new(&self.store);
        let transports = analytics.transport_distribution(&Window::default())?;
        Ok(json!({
            "total_messages": total,
            "unique_method_count": unique_methods.len(),
            "transports": transports.transports,
        }))
    }

    fn list_methods(&self) -> Result<Value> {
        let methods = self.store.unique_methods()?;
        Ok(json!({ "methods": methods }))
    }

    /// Handle one parsed JSON-RPC request/notification, returning `None`
    /// for notifications (no response is ever sent for those).
    pub fn handle(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let is_notification = id.is_none();

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": ServerCapabilities {
                    tools: Some(json!({})),
                    ..Default::default()
                },
                "serverInfo": Implementation {
                    name: "mcphawk".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    description: Some("Read-only query surface over captured MCP traffic".to_string()),
                },
            })),
            "notifications/initialized" => return None,
            "tools/list" => Ok(serde_json::to_value(ListToolsResponse {
                tools: Self::tool_catalog(),
                next_cursor: None,
                meta: None,
            })
            .unwrap()),
            "tools/call" => {
                let params: CallToolParams = match request
                    .params
                    .clone()
                    .ok_or(())
                    .and_then(|p| serde_json::from_value(p).map_err(|_| ()))
                {
                    Ok(p) => p,
                    Err(_) => {
                        if is_notification {
                            return None;
                        }
                        return Some(error_response(id, jsonrpc_codes::INVALID_PARAMS, "invalid tools/call params"));
                    }
                };
                match self.call_tool(&params) {
                    Ok(resp) => Ok(serde_json::to_value(resp).unwrap()),
                    Err(e) => Err(e.to_string()),
                }
            }
            other => {
                if is_notification {
                    return None;
                }
                return Some(error_response(
                    id,
                    jsonrpc_codes::METHOD_NOT_FOUND,
                    &format!("method not found: {other}"),
                ));
            }
        };

        if is_notification {
            return None;
        }

        Some(match result {
            Ok(value) => JsonRpcResponse { jsonrpc: "2.0".to_string(), id, result: Some(value), error: None },
            Err(message) => error_response(id, jsonrpc_codes::INTERNAL_ERROR, &message),
        })
    }

    /// Run the server over stdin/stdout, one JSON-RPC message per line.
    pub async fn run_stdio(self) -> Result<()> {
        let server = Arc::new(self);
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request: JsonRpcRequest = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "query server: dropping unparseable line");
                    continue;
                }
            };
            if let Some(response) = server.handle(&request) {
                let mut out = serde_json::to_string(&response)?;
                out.push('\n');
                stdout.write_all(out.as_bytes()).await?;
                stdout.flush().await?;
            }
        }
        info!("query server: stdin closed, exiting");
        Ok(())
    }

    /// Build the Streamable HTTP router: a single `POST /mcp` endpoint.
    pub fn router(self) -> Router {
        Router::new().route("/mcp", post(handle_http)).with_state(Arc::new(self))
    }

    /// Run the server as a Streamable HTTP listener on `addr`.
    pub async fn run_http(self, addr: std::net::SocketAddr) -> Result<()> {
        let router = self.router();
        info!(%addr, "query server: listening (streamable HTTP)");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn handle_http(
    State(server): State<Arc<QueryServer>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let is_initialize = request.method == "initialize";
    let is_notification = request.id.is_none();

    if !is_initialize && !is_notification {
        let session_id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
        if !server.session_is_valid(session_id) {
            let body = error_response(
                request.id.clone(),
                jsonrpc_codes::INVALID_REQUEST,
                "session not initialized",
            );
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
        }
    }

    match server.handle(&request) {
        Some(response) => {
            let mut http_response = Json(response).into_response();
            if is_initialize {
                let session_id = server.open_session();
                if let Ok(value) = HeaderValue::from_str(&session_id) {
                    http_response.headers_mut().insert(SESSION_HEADER, value);
                }
            }
            http_response
        }
        // Notifications get no body; 204 per the Streamable HTTP transport.
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn error_response(id: Option<Value>, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(JsonRpcError { code, message: message.to_string(), data: None }),
    }
}

fn error_tool_response(message: String) -> CallToolResponse {
    CallToolResponse {
        content: vec![ToolResponseContent::Text { text: message }],
        is_error: Some(true),
        structured_content: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Direction, MessageRecord, Peer};
    use chrono::Utc;
    use tempfile::tempdir;

    fn server_with_records(records: Vec<MessageRecord>) -> (QueryServer, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = MessageStore::open(dir.path().join("t.db")).unwrap();
        for r in records {
            store.insert(&r).unwrap();
        }
        (QueryServer::new(Arc::new(store)), dir)
    }

    fn record(id: &str, message: &str) -> MessageRecord {
        MessageRecord {
            log_id: id.to_string(),
            timestamp: Utc::now(),
            src: Peer { ip: "a".into(), port: Some(1) },
            dst: Peer { ip: "b".into(), port: Some(2) },
            pid: None,
            direction: Direction::Outgoing,
            transport_type: TransportType::StreamableHttp,
            message: message.to_string(),
            metadata: None,
        }
    }

    fn request(method: &str, id: Option<Value>, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest { jsonrpc: "2.0".to_string(), id, method: method.to_string(), params }
    }

    #[test]
    fn test_initialize_returns_server_info() {
        let (server, _dir) = server_with_records(vec![]);
        let resp = server.handle(&request("initialize", Some(json!(1)), None)).unwrap();
        assert_eq!(resp.result.unwrap()["serverInfo"]["name"], "mcphawk");
    }

    #[test]
    fn test_initialized_notification_gets_no_response() {
        let (server, _dir) = server_with_records(vec![]);
        assert!(server.handle(&request("notifications/initialized", None, None)).is_none());
    }

    #[test]
    fn test_tools_list_contains_five_tools() {
        let (server, _dir) = server_with_records(vec![]);
        let resp = server.handle(&request("tools/list", Some(json!(1)), None)).unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 5);
    }

    #[test]
    fn test_unknown_method_returns_method_not_found() {
        let (server, _dir) = server_with_records(vec![]);
        let resp = server.handle(&request("bogus/method", Some(json!(1)), None)).unwrap();
        assert_eq!(resp.error.unwrap().code, jsonrpc_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_query_traffic_tool_returns_records() {
        let (server, _dir) = server_with_records(vec![record(
            "a",
            r#"{"jsonrpc":"2.0","method":"ping","id":1}"#,
        )]);
        let params = json!({"name": "query_traffic", "arguments": {"limit": 10}});
        let resp = server
            .handle(&request("tools/call", Some(json!(1)), Some(params)))
            .unwrap();
        let result = resp.result.unwrap();
        let structured = &result["structuredContent"];
        assert_eq!(structured["count"], 1);
    }

    #[test]
    fn test_get_log_missing_id_returns_null() {
        let (server, _dir) = server_with_records(vec![]);
        let params = json!({"name": "get_log", "arguments": {"log_id": "missing"}});
        let resp = server
            .handle(&request("tools/call", Some(json!(1)), Some(params)))
            .unwrap();
        let structured = resp.result.unwrap()["structuredContent"].clone();
        assert!(structured.is_null());
    }

    #[test]
    fn test_call_unknown_tool_marks_is_error() {
        let (server, _dir) = server_with_records(vec![]);
        let params = json!({"name": "nonexistent"});
        let resp = server
            .handle(&request("tools/call", Some(json!(1)), Some(params)))
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
    }

    #[test]
    fn test_get_stats_reports_total() {
        let (server, _dir) = server_with_records(vec![record(
            "a",
            r#"{"jsonrpc":"2.0","method":"ping","id":1}"#,
        )]);
        let params = json!({"name": "get_stats"});
        let resp = server
            .handle(&request("tools/call", Some(json!(1)), Some(params)))
            .unwrap();
        let structured = &resp.result.unwrap()["structuredContent"];
        assert_eq!(structured["total_messages"], 1);
    }

    #[tokio::test]
    async fn test_http_notification_returns_204() {
        let (server, _dir) = server_with_records(vec![]);
        let app = server.router();
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let body = serde_json::to_vec(&request("notifications/initialized", None, None)).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_http_initialize_issues_session_header() {
        let (server, _dir) = server_with_records(vec![]);
        let app = server.router();
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let body = serde_json::to_vec(&request("initialize", Some(json!(1)), None)).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SESSION_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_http_tools_call_without_session_is_rejected() {
        let (server, _dir) = server_with_records(vec![]);
        let app = server.router();
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let params = json!({"name": "get_stats"});
        let body = serde_json::to_vec(&request("tools/call", Some(json!(2)), Some(params))).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], jsonrpc_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_http_tools_call_with_valid_session_succeeds() {
        let (server, _dir) = server_with_records(vec![]);
        let app = server.router();
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let init_body = serde_json::to_vec(&request("initialize", Some(json!(1)), None)).unwrap();
        let init_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(init_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let session_id = init_response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let params = json!({"name": "get_stats"});
        let body = serde_json::to_vec(&request("tools/call", Some(json!(2)), Some(params))).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .header(SESSION_HEADER, session_id)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
