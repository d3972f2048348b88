//! Integration coverage for the message store as used across process
//! boundaries: this exercises the same public surface the capture engine,
//! wrapper, and query server call.

mod common;

use chrono::Utc;
use common::*;
use mcphawk::record::{Direction, TransportType};
use mcphawk::store::QueryFilters;

#[test]
fn test_aggregate_respects_time_window_and_transport_filter() {
    let harness = open_test_store();
    let base = Utc::now();

    harness
        .store
        .insert(&network_record("old", base - chrono::Duration::hours(2), TransportType::StreamableHttp, Direction::Outgoing, &request(1, "ping")))
        .unwrap();
    harness
        .store
        .insert(&network_record("recent-http", base, TransportType::StreamableHttp, Direction::Outgoing, &request(2, "tools/call")))
        .unwrap();
    harness
        .store
        .insert(&network_record("recent-sse", base, TransportType::HttpSse, Direction::Incoming, &response(2)))
        .unwrap();

    let filters = QueryFilters {
        transport_type: Some(TransportType::StreamableHttp),
        start_time: Some(base - chrono::Duration::minutes(5)),
        end_time: Some(base + chrono::Duration::minutes(5)),
        ..Default::default()
    };
    let rows = harness.store.aggregate(&filters).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].log_id, "recent-http");
}

#[test]
fn test_time_range_spans_inserted_records() {
    let harness = open_test_store();
    assert!(harness.store.time_range().unwrap().is_none());

    let base = Utc::now();
    harness.store.insert(&network_record("a", base, TransportType::StreamableHttp, Direction::Outgoing, &request(1, "x"))).unwrap();
    harness
        .store
        .insert(&network_record("b", base + chrono::Duration::seconds(30), TransportType::StreamableHttp, Direction::Outgoing, &request(2, "y")))
        .unwrap();

    let (min, max) = harness.store.time_range().unwrap().unwrap();
    assert_eq!(min, base);
    assert_eq!(max, base + chrono::Duration::seconds(30));
}

#[test]
fn test_stdio_and_network_records_coexist() {
    let harness = open_test_store();
    let now = Utc::now();
    harness.store.insert(&stdio_record("s1", now, Direction::Outgoing, &request(1, "initialize"))).unwrap();
    harness
        .store
        .insert(&network_record("n1", now, TransportType::StreamableHttp, Direction::Outgoing, &request(2, "tools/list")))
        .unwrap();

    assert_eq!(harness.store.count().unwrap(), 2);
    let stdio = harness.store.get_by_id("s1").unwrap().unwrap();
    assert!(stdio.src.port.is_none());
    assert_eq!(stdio.pid, Some(4242));
}

#[test]
fn test_error_records_are_findable_by_message_type() {
    let harness = open_test_store();
    let now = Utc::now();
    harness
        .store
        .insert(&network_record("ok", now, TransportType::StreamableHttp, Direction::Incoming, &response(1)))
        .unwrap();
    harness
        .store
        .insert(&network_record("fail", now, TransportType::StreamableHttp, Direction::Incoming, &error_response(2, -32601, "method not found")))
        .unwrap();

    let results = harness.store.search("", Some("error"), None, 10).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].log_id, "fail");
}
