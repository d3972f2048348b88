//! MCP (Model Context Protocol) query server.
//!
//! `mcphawk mcp` exposes the message store as a small set of read-only
//! tools over either stdio or Streamable HTTP, so an LLM agent can inspect
//! captured traffic the same way it would call any other MCP server.
//!
//! # Module Layout
//!
//! - `types`  -- JSON-RPC 2.0 primitives and the subset of MCP protocol
//!   types this server needs (tool definitions, call params/results).
//! - `server` -- [`server::QueryServer`], the tool dispatcher and its two
//!   transport front ends.

pub mod server;
pub mod types;

pub use types::*;
