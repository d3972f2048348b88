//! Transparent interposition on a child MCP-server process's stdio (C6).

use crate::broadcast::BroadcastHub;
use crate::record::{Direction, MessageRecord, Peer, RecordMetadata, TransportType};
use crate::store::MessageStore;
use anyhow::Context;
use regex::Regex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace period between SIGTERM and SIGKILL on wrapper shutdown.
const TERMINATION_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Heuristic patterns for deriving a server name from the wrapped command
/// line when no protocol-derived `serverInfo` has been seen yet.
fn name_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"mcp-server-([a-zA-Z0-9_-]+)").unwrap(),
            Regex::new(r"([a-zA-Z0-9_-]+)-mcp-server").unwrap(),
            Regex::new(r"mcp-([a-zA-Z0-9_-]+)").unwrap(),
            Regex::new(r"([a-zA-Z0-9_-]+)-mcp").unwrap(),
        ]
    })
}

/// Best-effort `{name, version="unknown"}` extracted from a command line.
/// Protocol-derived info always supersedes this once seen.
pub fn derive_server_name(command_line: &str) -> Option<String> {
    if command_line.contains("mcphawk") && command_line.contains("mcp") {
        return Some("mcphawk-query-server".to_string());
    }
    for pattern in name_patterns() {
        if let Some(caps) = pattern.captures(command_line) {
            return caps.get(1).map(|m| m.as_str().to_string());
        }
    }
    None
}

/// A streaming brace-depth scanner that finds complete top-level JSON
/// objects within an accumulating byte stream, respecting string literals
/// and escapes.
#[derive(Default)]
pub struct JsonObjectScanner {
    buffer: String,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more text (a line, a chunk, anything); returns every complete
    /// top-level JSON object found, in order. Incomplete trailing text is
    /// retained for the next call.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut out = Vec::new();
        loop {
            match find_complete_object(&self.buffer) {
                Some((start, end)) => {
                    out.push(self.buffer[start..end].to_string());
                    self.buffer.drain(..end);
                }
                None => break,
            }
        }
        out
    }
}

/// Scan for the first complete `{...}` object in `text`, tracking brace
/// depth while skipping over string literals (including escaped quotes).
/// Returns `(start, end)` byte offsets of the object, `end` exclusive.
fn find_complete_object(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Runs the stdio wrapper for a single child process.
pub struct StdioWrapper {
    store: Arc<MessageStore>,
    hub: BroadcastHub,
    command_line: String,
}

impl StdioWrapper {
    pub fn new(store: Arc<MessageStore>, hub: BroadcastHub, command_line: String) -> Self {
        Self { store, hub, command_line }
    }

    /// Spawn `program args...`, pipe everything through byte-for-byte, scan
    /// for JSON-RPC objects in each direction, and return the child's exit
    /// code (or a conventional interrupted code if terminated by signal).
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> crate::error::Result<i32> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| crate::error::McpHawkError::ChildSpawn(e.to_string()))?;

        let pid = child.id().unwrap_or(0);
        info!(pid, command = %self.command_line, "stdio wrapper spawned child");

        let derived = derive_server_name(&self.command_line);

        let child_stdin = child.stdin.take().expect("piped stdin");
        let child_stdout = child.stdout.take().expect("piped stdout");
        let child_stderr = child.stderr.take().expect("piped stderr");

        let stdin_task = tokio::spawn(forward_and_scan_stdin(
            child_stdin,
            self.store.clone(),
            self.hub.clone(),
            pid,
            derived.clone(),
        ));

        let store = self.store.clone();
        let hub = self.hub.clone();
        let derived_for_stdout = derived.clone();
        let stdout_task = tokio::spawn(async move {
            forward_and_scan_stdout(child_stdout, store, hub, pid, derived_for_stdout).await
        });

        let stderr_task = tokio::spawn(forward_stderr(child_stderr));

        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait on child process")?;
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                Ok(status.code().unwrap_or(1))
            }
            _ = &mut shutdown => {
                terminate_child(&mut child).await;
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                Ok(130)
            }
        }
    }
}

async fn forward_and_scan_stdin(
    mut child_stdin: tokio::process::ChildStdin,
    store: Arc<MessageStore>,
    hub: BroadcastHub,
    pid: u32,
    server_name: Option<String>,
) {
    let mut stdin = tokio::io::stdin();
    let mut scanner = JsonObjectScanner::new();
    let mut buf = [0u8; 4096];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if child_stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                let chunk = String::from_utf8_lossy(&buf[..n]);
                for text in scanner.feed(&chunk) {
                    emit_stdio_record(&store, &hub, &text, Direction::Outgoing, pid, &server_name);
                }
            }
            Err(_) => break,
        }
    }
}

async fn forward_and_scan_stdout(
    child_stdout: tokio::process::ChildStdout,
    store: Arc<MessageStore>,
    hub: BroadcastHub,
    pid: u32,
    server_name: Option<String>,
) {
    let mut reader = BufReader::new(child_stdout);
    let mut stdout = tokio::io::stdout();
    let mut scanner = JsonObjectScanner::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;

                for text in scanner.feed(&line) {
                    emit_stdio_record(&store, &hub, &text, Direction::Incoming, pid, &server_name);
                }
            }
            Err(_) => break,
        }
    }
}

async fn forward_stderr(child_stderr: tokio::process::ChildStderr) {
    let mut reader = BufReader::new(child_stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                eprint!("{line}");
                debug!(target: "mcphawk::wrapper", "child stderr: {}", line.trim_end());
            }
            Err(_) => break,
        }
    }
}

fn emit_stdio_record(
    store: &MessageStore,
    hub: &BroadcastHub,
    text: &str,
    direction: Direction,
    pid: u32,
    server_name: &Option<String>,
) {
    if !crate::record::is_valid_jsonrpc(text) {
        return;
    }

    let metadata = server_name.as_ref().map(|name| RecordMetadata {
        server_name: Some(name.clone()),
        server_version: Some("unknown".to_string()),
        wrapped_command: None,
        ..Default::default()
    });

    // The wrapper always sits between an mcp-client and the wrapped
    // mcp-server: outgoing is client-to-server, incoming is the reverse.
    let (src, dst) = match direction {
        Direction::Outgoing => (
            Peer { ip: "mcp-client".into(), port: None },
            Peer { ip: "mcp-server".into(), port: None },
        ),
        Direction::Incoming => (
            Peer { ip: "mcp-server".into(), port: None },
            Peer { ip: "mcp-client".into(), port: None },
        ),
        Direction::Unknown => unreachable!("wrapper only emits Outgoing/Incoming directions"),
    };

    let record = MessageRecord {
        log_id: Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
        src,
        dst,
        pid: Some(pid),
        direction,
        transport_type: TransportType::Stdio,
        message: text.to_string(),
        metadata,
    };

    match store.insert(&record) {
        Ok(()) => hub.publish(record),
        Err(e) => debug!(error = %e, "dropping stdio record that failed to persist"),
    }
}

async fn terminate_child(child: &mut Child) {
    let pid = child.id();
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    let terminated = tokio::time::timeout(TERMINATION_GRACE, child.wait()).await;
    if terminated.is_err() {
        warn!("child did not exit within grace period, sending SIGKILL");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Flag flipped by the signal handler installed in `main`; retained here so
/// tests can assert the wrapper's termination path is reachable without a
/// real child process hanging around.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_server_name_mcp_server_prefix() {
        assert_eq!(
            derive_server_name("npx mcp-server-filesystem /tmp"),
            Some("filesystem".to_string())
        );
    }

    #[test]
    fn test_derive_server_name_mcp_server_suffix() {
        assert_eq!(
            derive_server_name("filesystem-mcp-server --root /tmp"),
            Some("filesystem".to_string())
        );
    }

    #[test]
    fn test_derive_server_name_short_prefix() {
        assert_eq!(derive_server_name("mcp-github"), Some("github".to_string()));
    }

    #[test]
    fn test_derive_server_name_short_suffix() {
        assert_eq!(derive_server_name("github-mcp"), Some("github".to_string()));
    }

    #[test]
    fn test_derive_server_name_returns_none_for_unrelated_command() {
        assert_eq!(derive_server_name("python3 server.py"), None);
    }

    #[test]
    fn test_scanner_extracts_two_objects_on_one_line() {
        let mut scanner = JsonObjectScanner::new();
        let line = r#"{"jsonrpc":"2.0","method":"a","id":1}{"jsonrpc":"2.0","result":"ok","id":1}"#;
        let objects = scanner.feed(line);
        assert_eq!(objects.len(), 2);
        assert!(objects[0].contains("\"method\":\"a\""));
        assert!(objects[1].contains("\"result\":\"ok\""));
    }

    #[test]
    fn test_scanner_handles_braces_in_string_literals() {
        let mut scanner = JsonObjectScanner::new();
        let line = r#"{"jsonrpc":"2.0","method":"x","params":{"note":"a { b } c"},"id":1}"#;
        let objects = scanner.feed(line);
        assert_eq!(objects.len(), 1);
        assert!(objects[0].contains("a { b } c"));
    }

    #[test]
    fn test_scanner_accumulates_partial_objects_across_feeds() {
        let mut scanner = JsonObjectScanner::new();
        assert!(scanner.feed(r#"{"jsonrpc":"2.0","meth"#).is_empty());
        let objects = scanner.feed(r#"od":"ping","id":1}"#);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_scanner_handles_escaped_quotes() {
        let mut scanner = JsonObjectScanner::new();
        let line = r#"{"jsonrpc":"2.0","method":"x","params":{"s":"a \" b"},"id":1}"#;
        let objects = scanner.feed(line);
        assert_eq!(objects.len(), 1);
    }
}
