//! Reconstruct complete HTTP requests/responses from raw TCP payloads and
//! extract JSON-RPC bodies (C4).

use crate::detector::{detect_transport, DetectionSignals};
use crate::record::TransportType;
use std::collections::{HashMap, HashSet};

/// Cap on a single connection's response buffer.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// An ordered 4-tuple used to key a TCP stream, independent of packet
/// direction: the two endpoints are canonicalized into an unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey(String, u16, String, u16);

impl StreamKey {
    pub fn new(ip_a: &str, port_a: u16, ip_b: &str, port_b: u16) -> Self {
        if (ip_a, port_a) < (ip_b, port_b) {
            StreamKey(ip_a.to_string(), port_a, ip_b.to_string(), port_b)
        } else {
            StreamKey(ip_b.to_string(), port_b, ip_a.to_string(), port_a)
        }
    }
}

/// The shape of an in-progress response body, distinguishing the three
/// framings the reassembler understands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyKind {
    Plain(usize),
    Sse,
    Chunked,
}

/// Explicit per-connection state machine rather than a mutable flag bag.
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    AwaitingRequest,
    InRequestBody,
    AwaitingResponseHeaders,
    InResponseBody(BodyKind),
}

/// A message extracted by the reassembler, ready for C5 to turn into a
/// [`crate::record::MessageRecord`].
#[derive(Debug, Clone)]
pub struct ExtractedMessage {
    pub text: String,
    /// `true` for a response body extraction, `false` for a request body.
    pub is_response: bool,
    pub transport: TransportType,
}

struct Http {
    state: State,
    request_method: Option<String>,
    request_accept: Option<String>,
    buffer: Vec<u8>,
    response_headers: HashMap<String, String>,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            state: State::AwaitingRequest,
            request_method: None,
            request_accept: None,
            buffer: Vec::new(),
            response_headers: HashMap::new(),
        }
    }
}

impl Http {
    fn reset_response(&mut self) {
        self.state = State::AwaitingRequest;
        self.buffer.clear();
        self.response_headers.clear();
    }
}

/// Per-process reassembler, owning every connection's [`Http`] state
/// exclusively -- the capture engine is its only caller.
#[derive(Default)]
pub struct StreamReassembler {
    streams: HashMap<StreamKey, Http>,
    /// URL advertised by an `event: endpoint` block, per connection.
    endpoint_urls: HashMap<StreamKey, String>,
    /// Server endpoints (ip, port) that have advertised an `event: endpoint`
    /// handshake on any connection -- mirrors [`crate::detector::TransportTracker`]'s
    /// server-tuple stickiness rule, but at the reassembler layer so a new
    /// client connecting to an already-confirmed http_sse server classifies
    /// correctly even before that connection's own headers are read.
    confirmed_http_sse_servers: HashSet<(String, u16)>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one directional TCP payload into the reassembler. Returns any
    /// messages completed by this payload, plus the transport verdict the
    /// detector assigned at emission time.
    pub fn process(
        &mut self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<ExtractedMessage> {
        let key = StreamKey::new(src_ip, src_port, dst_ip, dst_port);
        let stream = self.streams.entry(key.clone()).or_default();

        if is_request_line(payload) {
            let (method, accept) = parse_request_head(payload);
            stream.request_method = method;
            stream.request_accept = accept;
            stream.state = State::InRequestBody;
            stream.buffer.clear();

            let mut messages = Vec::new();
            if let Some(text) = extract_single_json(payload) {
                let saw_endpoint = self.saw_endpoint_event(&key, src_ip, src_port, dst_ip, dst_port);
                let stream = self.streams.get(&key).expect("stream entry exists");
                let transport = self.classify_with(
                    stream.request_method.as_deref(),
                    stream.request_accept.as_deref(),
                    false,
                    saw_endpoint,
                );
                messages.push(ExtractedMessage { text, is_response: false, transport });
            }
            return messages;
        }

        if starts_with(payload, b"HTTP/1.") {
            stream.state = State::AwaitingResponseHeaders;
            stream.buffer.clear();
            stream.response_headers.clear();
        }

        let in_response_context = matches!(
            stream.state,
            State::AwaitingResponseHeaders | State::InResponseBody(_)
        ) || starts_with(payload, b"HTTP/1.");

        if in_response_context {
            return self.process_response_bytes(&key, src_ip, src_port, payload);
        }

        // Standalone SSE continuation payload with no HTTP framing of its own;
        // `src_ip`/`src_port` is the server still streaming the response.
        if starts_with(payload, b"data: ") {
            stream.buffer.extend_from_slice(payload);
            let drained = drain_sse_events(&mut stream.buffer);
            self.record_endpoint_event(&key, src_ip, src_port, drained.endpoint_url);
            let saw_endpoint = self.saw_endpoint_event(&key, src_ip, src_port, dst_ip, dst_port);
            let transport = self.classify_with(None, None, true, saw_endpoint);
            return drained
                .texts
                .into_iter()
                .map(|text| ExtractedMessage { text, is_response: true, transport })
                .collect();
        }

        Vec::new()
    }

    fn process_response_bytes(
        &mut self,
        key: &StreamKey,
        server_ip: &str,
        server_port: u16,
        payload: &[u8],
    ) -> Vec<ExtractedMessage> {
        let stream = self.streams.get_mut(key).expect("stream entry exists");

        if stream.state == State::AwaitingResponseHeaders {
            stream.buffer.extend_from_slice(payload);
            if let Some(header_end) = find_header_terminator(&stream.buffer) {
                let header_bytes = stream.buffer[..header_end].to_vec();
                let body_start = header_end;
                let remaining = stream.buffer[body_start..].to_vec();
                stream.response_headers = parse_headers(&header_bytes);

                let content_type = stream
                    .response_headers
                    .get("content-type")
                    .cloned()
                    .unwrap_or_default();
                let transfer_encoding = stream
                    .response_headers
                    .get("transfer-encoding")
                    .cloned()
                    .unwrap_or_default();
                let is_sse = content_type.contains("text/event-stream");
                let is_chunked = transfer_encoding.contains("chunked");

                stream.state = if is_chunked {
                    State::InResponseBody(BodyKind::Chunked)
                } else if is_sse {
                    State::InResponseBody(BodyKind::Sse)
                } else {
                    let len = stream
                        .response_headers
                        .get("content-length")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    State::InResponseBody(BodyKind::Plain(len))
                };
                stream.buffer = remaining;
            } else if stream.buffer.len() > MAX_BUFFER_BYTES {
                stream.reset_response();
                return Vec::new();
            } else {
                return Vec::new();
            }
        } else {
            stream.buffer.extend_from_slice(payload);
        }

        if stream.buffer.len() > MAX_BUFFER_BYTES {
            stream.reset_response();
            return Vec::new();
        }

        let (texts, endpoint_url) = match stream.state.clone() {
            State::InResponseBody(BodyKind::Plain(len)) => {
                if stream.buffer.len() >= len {
                    let body = stream.buffer[..len].to_vec();
                    stream.buffer.drain(..len);
                    let text = String::from_utf8_lossy(&body).trim().to_string();
                    stream.state = State::AwaitingRequest;
                    (if text.is_empty() { vec![] } else { vec![text] }, None)
                } else {
                    (vec![], None)
                }
            }
            State::InResponseBody(BodyKind::Sse) => {
                let drained = drain_sse_events(&mut stream.buffer);
                let endpoint_url = drained.endpoint_url;
                (drained.texts, endpoint_url)
            }
            State::InResponseBody(BodyKind::Chunked) => {
                let dechunked = dechunk(&mut stream.buffer);
                match dechunked {
                    DechunkResult::Complete(body) => {
                        stream.state = State::AwaitingRequest;
                        let drained = drain_sse_events_from_bytes(body);
                        (drained.texts, drained.endpoint_url)
                    }
                    DechunkResult::Incomplete => (vec![], None),
                }
            }
            _ => (vec![], None),
        };

        let method = stream.request_method.clone();
        let accept = stream.request_accept.clone();
        self.record_endpoint_event(key, server_ip, server_port, endpoint_url);
        let saw_endpoint = self.endpoint_urls.contains_key(key) || self.server_confirmed(server_ip, server_port);
        let transport = self.classify_with(method.as_deref(), accept.as_deref(), true, saw_endpoint);

        texts
            .into_iter()
            .map(|text| ExtractedMessage { text, is_response: true, transport })
            .collect()
    }

    /// Whether this connection, or either of its endpoints standing in for a
    /// server already confirmed by a prior connection, has seen an
    /// `event: endpoint` handshake.
    fn saw_endpoint_event(&self, key: &StreamKey, ip_a: &str, port_a: u16, ip_b: &str, port_b: u16) -> bool {
        self.endpoint_urls.contains_key(key) || self.server_confirmed(ip_a, port_a) || self.server_confirmed(ip_b, port_b)
    }

    fn server_confirmed(&self, ip: &str, port: u16) -> bool {
        self.confirmed_http_sse_servers.contains(&(ip.to_string(), port))
    }

    /// Remember a freshly observed endpoint-event URL for `key`, if any, and
    /// mark `server_ip:server_port` as a confirmed http_sse server so later
    /// connections from other clients to the same server classify correctly
    /// too.
    fn record_endpoint_event(&mut self, key: &StreamKey, server_ip: &str, server_port: u16, url: Option<String>) {
        if let Some(url) = url {
            self.endpoint_urls.insert(key.clone(), url);
            self.confirmed_http_sse_servers.insert((server_ip.to_string(), server_port));
        }
    }

    /// The URL advertised by an `event: endpoint` handshake observed so far
    /// on this connection, if any.
    pub fn advertised_endpoint_url(
        &self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
    ) -> Option<String> {
        let key = StreamKey::new(src_ip, src_port, dst_ip, dst_port);
        self.endpoint_urls.get(&key).cloned()
    }

    fn classify_with(
        &self,
        method: Option<&str>,
        accept: Option<&str>,
        is_sse_response: bool,
        response_contains_endpoint_event: bool,
    ) -> TransportType {
        let signals = DetectionSignals {
            method,
            accept_header: accept,
            is_sse_response,
            response_contains_endpoint_event,
        };
        detect_transport(&signals)
    }

    /// Drop accumulated state for a closed or idle connection.
    pub fn forget(&mut self, src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) {
        let key = StreamKey::new(src_ip, src_port, dst_ip, dst_port);
        self.streams.remove(&key);
        self.endpoint_urls.remove(&key);
    }
}

fn is_request_line(payload: &[u8]) -> bool {
    starts_with(payload, b"GET ") || starts_with(payload, b"POST ")
}

fn starts_with(payload: &[u8], prefix: &[u8]) -> bool {
    payload.len() >= prefix.len() && &payload[..prefix.len()] == prefix
}

fn parse_request_head(payload: &[u8]) -> (Option<String>, Option<String>) {
    let text = String::from_utf8_lossy(payload);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let method = request_line.split_whitespace().next().map(str::to_string);

    let mut accept = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case("accept") {
                accept = Some(v.trim().to_string());
            }
        }
    }
    (method, accept)
}

fn parse_headers(header_bytes: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(header_bytes);
    let mut headers = HashMap::new();
    for line in text.split("\r\n").skip(1) {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    headers
}

fn find_header_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// A full JSON-RPC object embedded directly in one packet with no HTTP
/// framing at all, for request bodies that arrive in the same payload as
/// the headers.
fn extract_single_json(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    let body_start = text.find("\r\n\r\n")? + 4;
    let body = text[body_start..].trim();
    if body.starts_with('{') && body.contains("jsonrpc") {
        Some(body.to_string())
    } else {
        None
    }
}

/// Result of draining buffered SSE event blocks: JSON-RPC candidate texts,
/// plus the URL advertised by an `event: endpoint` block, if one was seen.
struct SseDrain {
    texts: Vec<String>,
    endpoint_url: Option<String>,
}

/// Scan `buffer` for complete SSE event blocks (terminated by `\r\n\r\n` or
/// `\n\n`, whichever appears first). An `event: endpoint` block is the legacy
/// HTTP+SSE handshake: its `data:` payload is a URL (either a bare path or a
/// `{"url": "..."}` object), never a JSON-RPC message, so it is captured
/// separately and excluded from the returned texts. Incomplete trailing
/// bytes are retained.
fn drain_sse_events(buffer: &mut Vec<u8>) -> SseDrain {
    let mut out = Vec::new();
    let mut endpoint_url = None;
    loop {
        let crlf = find_subslice(buffer, b"\r\n\r\n");
        let lf = find_subslice(buffer, b"\n\n");
        let (end, sep_len) = match (crlf, lf) {
            (Some(a), Some(b)) if a <= b => (a, 4),
            (Some(a), Some(_)) => (a, 4),
            (Some(a), None) => (a, 4),
            (None, Some(b)) => (b, 2),
            (None, None) => break,
        };
        let event_block = buffer[..end].to_vec();
        buffer.drain(..end + sep_len);

        let text = String::from_utf8_lossy(&event_block);
        let mut event_name = None;
        let mut data_lines = Vec::new();
        for line in text.split(['\n']) {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("event: ").or_else(|| line.strip_prefix("event:")) {
                event_name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                data_lines.push(rest.trim().to_string());
            }
        }

        if event_name.as_deref() == Some("endpoint") {
            if let Some(data) = data_lines.first() {
                endpoint_url = Some(extract_endpoint_url(data));
            }
            continue;
        }

        for data in data_lines {
            if data.starts_with('{') {
                out.push(data);
            }
        }
    }
    SseDrain { texts: out, endpoint_url }
}

/// An `event: endpoint` payload is either a bare path (`/messages?id=1`) or a
/// JSON object carrying a `url` field; accept both shapes.
fn extract_endpoint_url(data: &str) -> String {
    if data.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(url) = value.get("url").and_then(|u| u.as_str()) {
                return url.to_string();
            }
        }
    }
    data.to_string()
}

fn drain_sse_events_from_bytes(bytes: Vec<u8>) -> SseDrain {
    let mut bytes = bytes;
    drain_sse_events(&mut bytes)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

enum DechunkResult {
    Complete(Vec<u8>),
    Incomplete,
}

/// Decode HTTP chunked transfer-encoding. Consumes chunk framing from
/// `buffer` up to and including the terminating zero-size chunk; returns
/// `Incomplete` and leaves `buffer` untouched if the final chunk hasn't
/// arrived yet.
fn dechunk(buffer: &mut Vec<u8>) -> DechunkResult {
    let mut cursor = 0usize;
    let mut out = Vec::new();

    loop {
        let rest = &buffer[cursor..];
        let line_end = match find_subslice(rest, b"\r\n") {
            Some(p) => p,
            None => return DechunkResult::Incomplete,
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let chunk_size = match usize::from_str_radix(size_hex, 16) {
            Ok(n) => n,
            Err(_) => return DechunkResult::Incomplete,
        };

        let chunk_start = cursor + line_end + 2;
        if chunk_size == 0 {
            buffer.drain(..chunk_start);
            return DechunkResult::Complete(out);
        }

        let chunk_end = chunk_start + chunk_size;
        if buffer.len() < chunk_end + 2 {
            return DechunkResult::Incomplete;
        }

        out.extend_from_slice(&buffer[chunk_start..chunk_end]);
        cursor = chunk_end + 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_post_with_body_extracts_request() {
        let mut r = StreamReassembler::new();
        let payload = b"POST /mcp HTTP/1.1\r\nAccept: application/json, text/event-stream\r\nContent-Type: application/json\r\nContent-Length: 55\r\n\r\n{\"jsonrpc\":\"2.0\",\"method\":\"initialize\",\"params\":{},\"id\":1}";
        let out = r.process("10.0.0.1", 55000, "10.0.0.2", 8080, payload);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_response);
        assert_eq!(out[0].transport, TransportType::StreamableHttp);
        assert!(out[0].text.contains("initialize"));
    }

    #[test]
    fn test_http_sse_endpoint_event_then_sticky_post() {
        let mut r = StreamReassembler::new();
        r.process("10.0.0.1", 55000, "10.0.0.2", 9000, b"GET /sse HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n");
        let out = r.process(
            "10.0.0.2",
            9000,
            "10.0.0.1",
            55000,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\nevent: endpoint\ndata: {\"url\":\"/messages\"}\n\n",
        );
        // The endpoint event's own body is a handshake URL, not a JSON-RPC
        // candidate, so it yields no extracted messages here -- only the
        // advertised URL and the classification it confirms.
        assert!(out.is_empty());
        assert_eq!(
            r.advertised_endpoint_url("10.0.0.2", 9000, "10.0.0.1", 55000),
            Some("/messages".to_string())
        );

        let post = r.process(
            "10.0.0.1",
            55000,
            "10.0.0.2",
            9000,
            b"POST /messages HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 40\r\n\r\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":2}",
        );
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].transport, TransportType::HttpSse);
    }

    #[test]
    fn test_chunked_sse_split_across_packets_yields_one_record() {
        let mut r = StreamReassembler::new();
        r.process(
            "c",
            1,
            "s",
            2,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let a = r.process(
            "c",
            1,
            "s",
            2,
            b"3e\r\nevent: message\r\ndata: {\"jsonrpc\":\"2.0\",\"result\":{\"ok\":true},\"id\":1}\r\n\r\n\r\n",
        );
        assert!(a.is_empty(), "final chunk not yet seen");

        let b = r.process("c", 1, "s", 2, b"0\r\n\r\n");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].text, r#"{"jsonrpc":"2.0","result":{"ok":true},"id":1}"#);
        assert!(b[0].is_response);
    }

    #[test]
    fn test_plain_content_length_response() {
        let mut r = StreamReassembler::new();
        let body = r#"{"jsonrpc":"2.0","result":{},"id":1}"#;
        let payload = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let out = r.process("c", 1, "s", 2, payload.as_bytes());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, body);
    }

    #[test]
    fn test_buffer_overflow_resets_connection() {
        let mut r = StreamReassembler::new();
        r.process(
            "c",
            1,
            "s",
            2,
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 99999999\r\n\r\n",
        );
        let huge = vec![b'x'; MAX_BUFFER_BYTES + 1];
        let out = r.process("c", 1, "s", 2, &huge);
        assert!(out.is_empty());

        // Connection entry survives; a fresh well-formed exchange still works.
        let body = r#"{"jsonrpc":"2.0","result":{},"id":2}"#;
        let payload = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let out2 = r.process("c", 1, "s", 2, payload.as_bytes());
        assert_eq!(out2.len(), 1);
    }
}
