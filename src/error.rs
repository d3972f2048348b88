//! Error types for MCPHawk
//!
//! This module defines all error types used throughout the capture,
//! storage, analytics, and query-server pipelines, using `thiserror` for
//! ergonomic error handling. Most variants are non-fatal and are logged
//! then dropped so the capture pipeline never crashes on malformed wire
//! data.

use thiserror::Error;

/// Main error type for MCPHawk operations.
#[derive(Error, Debug)]
pub enum McpHawkError {
    /// BPF compile failure, interface unavailable, or insufficient
    /// privilege. Fatal at startup.
    #[error("capture startup error: {0}")]
    CaptureStartup(String),

    /// HTTP parse failure, invalid JSON, or invalid JSON-RPC shape.
    /// Non-fatal: the offending bytes are skipped and capture continues.
    #[error("malformed protocol data: {0}")]
    MalformedProtocol(String),

    /// The reassembler could not find a frame boundary within the
    /// configured buffer cap. The connection's accumulator is reset.
    #[error("stream desynchronized: {0}")]
    StreamDesync(String),

    /// A `log_id` was already present in the store.
    #[error("duplicate log id: {0}")]
    DuplicateId(String),

    /// The backing storage medium is unavailable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record failed a data-model invariant at insert time.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Generic storage error (I/O, SQL, migration).
    #[error("storage error: {0}")]
    Storage(String),

    /// The child process could not be spawned.
    #[error("failed to spawn child process: {0}")]
    ChildSpawn(String),

    /// The query/live API received invalid parameters or addressed an
    /// unknown method/tool.
    #[error("client error: {0}")]
    ClientError(String),

    /// General MCP protocol error (lifecycle, capability negotiation).
    #[error("MCP error: {0}")]
    Mcp(String),

    /// MCP transport-level I/O failure.
    #[error("MCP transport error: {0}")]
    McpTransport(String),

    /// Configuration error (invalid file, contradictory CLI options).
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors (config file).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite errors.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Packet capture errors from the underlying libpcap binding.
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON-RPC 2.0 standard error codes used when surfacing `ClientError`s
/// over the wire.
pub mod jsonrpc_codes {
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameter(s).
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Result type alias for MCPHawk operations.
///
/// Uses `anyhow::Error` so call sites can freely attach context while
/// library boundaries still downcast to [`McpHawkError`] when needed.
pub type Result<T> = anyhow::Result<T>;
