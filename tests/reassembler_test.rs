//! Integration coverage for a full request/response exchange flowing
//! through the reassembler into stored records, exercising the path the
//! capture engine drives in production.

mod common;

use common::*;
use chrono::Utc;
use mcphawk::reassembler::StreamReassembler;
use mcphawk::record::{Direction, TransportType};

#[test]
fn test_streamable_http_round_trip_produces_two_stored_records() {
    let mut reassembler = StreamReassembler::new();
    let harness = open_test_store();

    let request_payload = b"POST /mcp HTTP/1.1\r\nAccept: application/json, text/event-stream\r\nContent-Type: application/json\r\nContent-Length: 58\r\n\r\n{\"jsonrpc\":\"2.0\",\"method\":\"tools/list\",\"params\":{},\"id\":9}";
    let request_messages = reassembler.process("10.1.1.1", 51234, "10.1.1.2", 8080, request_payload);
    assert_eq!(request_messages.len(), 1);
    assert!(!request_messages[0].is_response);
    assert_eq!(request_messages[0].transport, TransportType::StreamableHttp);

    let body = r#"{"jsonrpc":"2.0","result":{"tools":[]},"id":9}"#;
    let response_payload = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response_messages = reassembler.process("10.1.1.2", 8080, "10.1.1.1", 51234, response_payload.as_bytes());
    assert_eq!(response_messages.len(), 1);
    assert!(response_messages[0].is_response);
    assert_eq!(response_messages[0].text, body);

    let now = Utc::now();
    harness
        .store
        .insert(&network_record("req-9", now, request_messages[0].transport, Direction::Outgoing, &request_messages[0].text))
        .unwrap();
    harness
        .store
        .insert(&network_record(
            "resp-9",
            now,
            response_messages[0].transport,
            Direction::Incoming,
            &response_messages[0].text,
        ))
        .unwrap();

    assert_eq!(harness.store.count().unwrap(), 2);
    let stored_response = harness.store.get_by_id("resp-9").unwrap().unwrap();
    assert_eq!(stored_response.method(), None);
}

#[test]
fn test_sse_stream_carries_multiple_independent_connections() {
    let mut reassembler = StreamReassembler::new();

    // Two unrelated SSE connections must not share buffered state.
    reassembler.process("a", 1, "server", 9000, b"GET /sse HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n");
    reassembler.process("b", 2, "server", 9001, b"GET /sse HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n");

    let out_a = reassembler.process(
        "server",
        9000,
        "a",
        1,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
    );
    let out_b = reassembler.process(
        "server",
        9001,
        "b",
        2,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: {\"jsonrpc\":\"2.0\",\"result\":{},\"id\":3}\n\n",
    );

    assert!(out_a.iter().any(|m| m.text.contains("notifications/progress")));
    assert!(out_b.iter().any(|m| m.text.contains("\"id\":3")));
}
