//! Drive the reassembler from live network packets and write normalized
//! records (C5).

use crate::broadcast::BroadcastHub;
use crate::detector::TransportTracker;
use crate::reassembler::StreamReassembler;
use crate::record::{Direction, MessageRecord, Peer, RecordMetadata};
use crate::store::MessageStore;
use anyhow::Context;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap::{Capture, Device};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// How the engine selects traffic to inspect.
#[derive(Debug, Clone)]
pub enum CaptureTarget {
    /// A fixed port (`--port P`).
    Port(u16),
    /// An arbitrary user BPF expression (`--filter BPF`).
    Filter(String),
    /// No port restriction; log first sightings of MCP traffic per port
    /// (`--auto-detect`).
    AutoDetect,
}

impl CaptureTarget {
    fn bpf_expression(&self) -> String {
        match self {
            CaptureTarget::Port(p) => format!("tcp port {p}"),
            CaptureTarget::Filter(expr) => expr.clone(),
            CaptureTarget::AutoDetect => "tcp".to_string(),
        }
    }
}

/// Engine configuration, passed by value rather than read from
/// process-wide mutable state.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub target: CaptureTarget,
    pub excluded_ports: HashSet<u16>,
    pub device: Option<String>,
}

struct ServerInfoEntry {
    name: String,
    version: String,
}

/// Owns every piece of per-process capture state: the reassembler, the
/// transport tracker, and the `initialize` server/client identity cache.
pub struct CaptureEngine {
    config: CaptureConfig,
    store: Arc<MessageStore>,
    hub: BroadcastHub,
    reassembler: StreamReassembler,
    tracker: TransportTracker,
    server_registry: HashMap<(String, u16, String, u16), ServerInfoEntry>,
    announced_ports: HashSet<u16>,
}

impl CaptureEngine {
    pub fn new(config: CaptureConfig, store: Arc<MessageStore>, hub: BroadcastHub) -> Self {
        Self {
            config,
            store,
            hub,
            reassembler: StreamReassembler::new(),
            tracker: TransportTracker::new(),
            server_registry: HashMap::new(),
            announced_ports: HashSet::new(),
        }
    }

    /// Open the capture handle and run until `shutdown` resolves.
    ///
    /// Blocking packet reads happen on a dedicated blocking task so the
    /// async runtime's worker threads are never starved.
    pub async fn run(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> crate::error::Result<()> {
        let device = match &self.config.device {
            Some(name) => Device::list()
                .context("failed to list capture devices")?
                .into_iter()
                .find(|d| d.name == *name)
                .ok_or_else(|| {
                    crate::error::McpHawkError::CaptureStartup(format!("device not found: {name}"))
                })?,
            None => Device::lookup()
                .context("failed to look up default capture device")?
                .ok_or_else(|| {
                    crate::error::McpHawkError::CaptureStartup("no default capture device".into())
                })?,
        };

        let mut cap = Capture::from_device(device)
            .map_err(|e| crate::error::McpHawkError::CaptureStartup(e.to_string()))?
            .promisc(true)
            .snaplen(65535)
            .timeout(100)
            .open()
            .map_err(|e| crate::error::McpHawkError::CaptureStartup(e.to_string()))?;

        let filter = self.config.target.bpf_expression();
        cap.filter(&filter, true)
            .map_err(|e| crate::error::McpHawkError::CaptureStartup(e.to_string()))?;

        info!(filter = %filter, "packet capture started");

        loop {
            if shutdown.try_recv().is_ok() {
                break;
            }
            match cap.next_packet() {
                Ok(packet) => self.handle_packet(packet.data),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    error!(error = %e, "packet capture read failed");
                    break;
                }
            }
        }

        info!("packet capture stopped");
        Ok(())
    }

    /// Process one raw Ethernet frame.
    fn handle_packet(&mut self, data: &[u8]) {
        let parsed = match SlicedPacket::from_ethernet(data) {
            Ok(p) => p,
            Err(_) => return,
        };

        let (src_ip, dst_ip) = match parsed.net {
            Some(NetSlice::Ipv4(ref ip)) => (
                ip.header().source_addr().to_string(),
                ip.header().destination_addr().to_string(),
            ),
            Some(NetSlice::Ipv6(ref ip)) => (
                ip.header().source_addr().to_string(),
                ip.header().destination_addr().to_string(),
            ),
            _ => return,
        };

        let tcp = match parsed.transport {
            Some(TransportSlice::Tcp(ref tcp)) => tcp,
            _ => return,
        };

        let payload = tcp.payload();
        if payload.is_empty() {
            return;
        }

        let src_port = tcp.source_port();
        let dst_port = tcp.destination_port();

        // Excluded-port self-capture suppression.
        if self.config.excluded_ports.contains(&src_port)
            || self.config.excluded_ports.contains(&dst_port)
        {
            return;
        }

        if matches!(self.config.target, CaptureTarget::AutoDetect) {
            for port in [src_port, dst_port] {
                if self.announced_ports.insert(port) {
                    info!(port, "MCP traffic observed on new port");
                }
            }
        }

        // Step 2: stream reassembly.
        let extracted =
            self.reassembler
                .process(&src_ip, src_port, &dst_ip, dst_port, payload);

        let mut texts: Vec<(String, bool)> =
            extracted.into_iter().map(|m| (m.text, m.is_response)).collect();

        // Step 3: direct single-packet fallback for connections without HTTP context.
        if texts.is_empty() {
            if let Ok(text) = std::str::from_utf8(payload) {
                let trimmed = text.trim();
                if trimmed.starts_with('{') && trimmed.contains("jsonrpc") {
                    let is_response = crate::record::infer_direction_from_shape(trimmed)
                        == Direction::Incoming;
                    texts.push((trimmed.to_string(), is_response));
                }
            }
        }

        for (text, is_response) in texts {
            self.emit(&src_ip, src_port, &dst_ip, dst_port, &text, is_response);
        }
    }

    fn emit(
        &mut self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        text: &str,
        is_response: bool,
    ) {
        let transport = self.tracker.get(src_ip, src_port, dst_ip, dst_port);

        // Cache initialize serverInfo/clientInfo for this connection.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
            if value.get("method").and_then(|m| m.as_str()) == Some("initialize") {
                if let Some(info) = value.pointer("/params/clientInfo") {
                    self.cache_identity(src_ip, src_port, dst_ip, dst_port, info, true);
                }
            }
            if value.get("result").and_then(|r| r.get("serverInfo")).is_some() {
                if let Some(info) = value.pointer("/result/serverInfo") {
                    self.cache_identity(src_ip, src_port, dst_ip, dst_port, info, false);
                }
            }
        }

        let direction = if is_response {
            Direction::Incoming
        } else {
            match crate::record::classify_message_type(text) {
                crate::record::MessageType::Request | crate::record::MessageType::Notification => {
                    Direction::Outgoing
                }
                crate::record::MessageType::Response | crate::record::MessageType::Error => {
                    Direction::Incoming
                }
                crate::record::MessageType::Unknown => Direction::Unknown,
            }
        };

        let metadata = self.lookup_metadata(src_ip, src_port, dst_ip, dst_port);

        let record = MessageRecord {
            log_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            src: Peer { ip: src_ip.to_string(), port: Some(src_port) },
            dst: Peer { ip: dst_ip.to_string(), port: Some(dst_port) },
            pid: None,
            direction,
            transport_type: transport,
            message: text.to_string(),
            metadata,
        };

        match self.store.insert(&record) {
            Ok(()) => self.hub.publish(record),
            Err(e) => debug!(error = %e, "dropping record that failed to persist"),
        }
    }

    fn cache_identity(
        &mut self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        info: &serde_json::Value,
        is_client: bool,
    ) {
        let name = info.get("name").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let version = info.get("version").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let key = if is_client {
            (src_ip.to_string(), src_port, dst_ip.to_string(), dst_port)
        } else {
            (dst_ip.to_string(), dst_port, src_ip.to_string(), src_port)
        };
        self.server_registry.insert(key, ServerInfoEntry { name, version });
    }

    fn lookup_metadata(
        &self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
    ) -> Option<RecordMetadata> {
        let forward = (src_ip.to_string(), src_port, dst_ip.to_string(), dst_port);
        let reverse = (dst_ip.to_string(), dst_port, src_ip.to_string(), src_port);

        let entry = self.server_registry.get(&forward).or_else(|| self.server_registry.get(&reverse));
        let endpoint_url = self.reassembler.advertised_endpoint_url(src_ip, src_port, dst_ip, dst_port);

        if entry.is_none() && endpoint_url.is_none() {
            return None;
        }

        Some(RecordMetadata {
            server_name: entry.map(|e| e.name.clone()),
            server_version: entry.map(|e| e.version.clone()),
            endpoint_url,
            ..Default::default()
        })
    }
}
