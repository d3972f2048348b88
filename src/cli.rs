//! Command-line interface definition for MCPHawk
//!
//! Defines the CLI structure using clap's derive API: `sniff`, `web`, `mcp`,
//! and `wrap` subcommands.

use crate::config::McpTransportKind;
use clap::{Parser, Subcommand};

/// MCPHawk -- passive observability for the Model Context Protocol.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcphawk")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable debug logging regardless of RUST_LOG.
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Live console capture.
    Sniff {
        /// Capture traffic on a fixed TCP port.
        #[arg(long, conflicts_with_all = ["filter", "auto_detect"])]
        port: Option<u16>,

        /// Capture traffic matching an arbitrary BPF expression.
        #[arg(long, conflicts_with_all = ["port", "auto_detect"])]
        filter: Option<String>,

        /// Auto-detect MCP traffic across all ports.
        #[arg(long, conflicts_with_all = ["port", "filter"])]
        auto_detect: bool,

        /// Co-host the query server alongside capture.
        #[arg(long)]
        with_mcp: bool,

        /// Transport for the co-hosted query server.
        #[arg(long, default_value = "stdio")]
        mcp_transport: String,

        /// Port for the co-hosted query server, when using `http`.
        #[arg(long)]
        mcp_port: Option<u16>,
    },

    /// Live capture plus an HTTP dashboard.
    Web {
        #[arg(long, conflicts_with_all = ["filter", "auto_detect"])]
        port: Option<u16>,

        #[arg(long, conflicts_with_all = ["port", "auto_detect"])]
        filter: Option<String>,

        #[arg(long, conflicts_with_all = ["port", "filter"])]
        auto_detect: bool,

        /// Serve the dashboard against historical data only; do not capture.
        #[arg(long)]
        no_sniffer: bool,

        /// Dashboard bind host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Dashboard bind port.
        #[arg(long, default_value_t = 8080)]
        web_port: u16,
    },

    /// Run the query server standalone, against already-captured data.
    Mcp {
        /// Transport for the query server.
        #[arg(long, default_value = "stdio")]
        transport: String,

        /// Port to listen on, when using `http`.
        #[arg(long)]
        mcp_port: Option<u16>,
    },

    /// Transparently wrap a child MCP server's stdio and capture its traffic.
    Wrap {
        /// The command (and its arguments) to run as the wrapped server.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

impl Commands {
    /// Parse a `--{mcp-,}transport` flag value into [`McpTransportKind`],
    /// surfacing parse failures as the user-error exit path (exit code 1).
    pub fn parse_transport(value: &str) -> crate::error::Result<McpTransportKind> {
        McpTransportKind::parse(value)
    }
}
