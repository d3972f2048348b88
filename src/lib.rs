//! MCPHawk -- passive capture and observability tool for the Model Context
//! Protocol (MCP).
//!
//! # Architecture
//!
//! - [`record`]: the normalized `MessageRecord` data model shared by every
//!   capture path and consumer.
//! - [`store`]: SQLite-backed persistence (C1).
//! - [`broadcast`]: fan-out of newly inserted records to live subscribers (C2).
//! - [`detector`]: MCP transport classification (C3).
//! - [`reassembler`]: TCP stream reassembly into JSON-RPC bodies (C4).
//! - [`capture`]: the packet capture engine driving C3/C4 from the wire (C5).
//! - [`wrapper`]: transparent stdio interposition on a child server (C6).
//! - [`analytics`]: read-only aggregations over the store (C7).
//! - [`mcp`]: the MCP query server exposing C1/C7 as tools (C8).
//! - [`api`]: the HTTP dashboard surface (C9).
//! - [`config`]: configuration loading and validation.
//! - [`cli`]: command-line interface definition.
//! - [`error`]: error types and the crate-wide `Result` alias.

pub mod analytics;
pub mod api;
pub mod broadcast;
pub mod capture;
pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod mcp;
pub mod reassembler;
pub mod record;
pub mod store;
pub mod wrapper;

pub use config::Config;
pub use error::{McpHawkError, Result};
pub use record::MessageRecord;
pub use store::MessageStore;
