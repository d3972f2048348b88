//! Shared fixtures for integration tests.

use chrono::{DateTime, Utc};
use mcphawk::record::{Direction, MessageRecord, Peer, TransportType};
use mcphawk::store::MessageStore;
use tempfile::TempDir;

/// An on-disk store scoped to a temp directory that is cleaned up on drop.
pub struct TestStore {
    pub store: MessageStore,
    _dir: TempDir,
}

pub fn open_test_store() -> TestStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MessageStore::open(dir.path().join("mcphawk-test.db")).expect("open store");
    TestStore { store, _dir: dir }
}

/// Build a network-transport record with a JSON-RPC request body.
pub fn network_record(
    log_id: &str,
    timestamp: DateTime<Utc>,
    transport_type: TransportType,
    direction: Direction,
    message: &str,
) -> MessageRecord {
    MessageRecord {
        log_id: log_id.to_string(),
        timestamp,
        src: Peer { ip: "127.0.0.1".to_string(), port: Some(50000) },
        dst: Peer { ip: "127.0.0.1".to_string(), port: Some(8080) },
        pid: None,
        direction,
        transport_type,
        message: message.to_string(),
        metadata: None,
    }
}

/// Build a stdio-transport record.
pub fn stdio_record(log_id: &str, timestamp: DateTime<Utc>, direction: Direction, message: &str) -> MessageRecord {
    MessageRecord {
        log_id: log_id.to_string(),
        timestamp,
        src: Peer { ip: "mcp-client".to_string(), port: None },
        dst: Peer { ip: "mcp-server".to_string(), port: None },
        pid: Some(4242),
        direction,
        transport_type: TransportType::Stdio,
        message: message.to_string(),
        metadata: None,
    }
}

pub fn request(id: i64, method: &str) -> String {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": {} }).to_string()
}

pub fn response(id: i64) -> String {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} }).to_string()
}

pub fn error_response(id: i64, code: i64, message: &str) -> String {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }).to_string()
}
