//! Configuration for MCPHawk
//!
//! Settings are loaded from an optional YAML file, then overridden by
//! environment variables, then by CLI flags -- in that order of increasing
//! precedence.

use crate::error::{McpHawkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureSettings,
    pub storage: StorageSettings,
    pub mcp: McpServerSettings,
    pub web: WebSettings,
}

/// How the capture engine selects traffic, and the reassembler's memory cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub port: Option<u16>,
    pub filter: Option<String>,
    pub auto_detect: bool,
    pub excluded_ports: Vec<u16>,
    pub buffer_cap_bytes: usize,
    pub device: Option<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            port: None,
            filter: None,
            auto_detect: false,
            excluded_ports: Vec::new(),
            buffer_cap_bytes: crate::reassembler::MAX_BUFFER_BYTES,
            device: None,
        }
    }
}

/// Where captured records are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Overrides the `directories::ProjectDirs` default location.
    pub db_path: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { db_path: None }
    }
}

/// MCP transport a query server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    Stdio,
    Http,
}

impl McpTransportKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(McpTransportKind::Stdio),
            "http" => Ok(McpTransportKind::Http),
            other => Err(McpHawkError::Config(format!("unknown MCP transport: {other}")).into()),
        }
    }
}

/// Query-server settings, shared by the `mcp` subcommand and `--with-mcp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSettings {
    pub transport: McpTransportKind,
    pub port: u16,
}

impl Default for McpServerSettings {
    fn default() -> Self {
        Self { transport: McpTransportKind::Stdio, port: 8765 }
    }
}

/// Dashboard/live-API settings for the `web` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSettings {
    pub host: String,
    pub port: u16,
    pub run_sniffer: bool,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8080, run_sniffer: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            storage: StorageSettings::default(),
            mcp: McpServerSettings::default(),
            web: WebSettings::default(),
        }
    }
}

impl Config {
    /// Load from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) if Path::new(p).exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!(path = %p, "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_vars();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| McpHawkError::Config(format!("failed to read config file: {e}")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| McpHawkError::Config(format!("failed to parse config: {e}")).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(db_path) = std::env::var("MCPHAWK_STORE_DB") {
            self.storage.db_path = Some(db_path);
        }
        if let Ok(port) = std::env::var("MCPHAWK_MCP_PORT") {
            match port.parse() {
                Ok(value) => self.mcp.port = value,
                Err(_) => tracing::warn!(value = %port, "invalid MCPHAWK_MCP_PORT, ignoring"),
            }
        }
        if let Ok(host) = std::env::var("MCPHAWK_WEB_HOST") {
            self.web.host = host;
        }
        if let Ok(port) = std::env::var("MCPHAWK_WEB_PORT") {
            match port.parse() {
                Ok(value) => self.web.port = value,
                Err(_) => tracing::warn!(value = %port, "invalid MCPHAWK_WEB_PORT, ignoring"),
            }
        }
    }

    /// Reject contradictory settings: the CLI's mutual-exclusion rule for
    /// `--port`/`--filter`/`--auto-detect` applies here too once a config
    /// file supplies capture settings directly.
    pub fn validate(&self) -> Result<()> {
        let selectors = [
            self.capture.port.is_some(),
            self.capture.filter.is_some(),
            self.capture.auto_detect,
        ]
        .iter()
        .filter(|b| **b)
        .count();

        if selectors > 1 {
            return Err(McpHawkError::Config(
                "capture.port, capture.filter, and capture.auto_detect are mutually exclusive".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
