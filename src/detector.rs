//! Classify a connection's MCP transport from HTTP features (C3).

use crate::record::TransportType;
use std::collections::HashMap;

/// The four-tuple (client endpoint, server endpoint) identifying a single
/// TCP connection, independent of which side is "source" for a given packet.
pub type ConnectionTuple = (String, u16, String, u16);

/// A server endpoint (ip, port), used for the http_sse stickiness rule.
pub type ServerTuple = (String, u16);

/// Inputs to the classification function, gathered by the reassembler as it
/// parses a request/response pair.
#[derive(Debug, Clone, Default)]
pub struct DetectionSignals<'a> {
    pub method: Option<&'a str>,
    pub accept_header: Option<&'a str>,
    pub is_sse_response: bool,
    pub response_contains_endpoint_event: bool,
}

/// Pure classification function: no side effects, no memory of prior
/// connections. Rules are checked in priority order, most specific first.
pub fn detect_transport(signals: &DetectionSignals) -> TransportType {
    let accept = signals.accept_header.unwrap_or("").to_ascii_lowercase();

    if signals.method == Some("GET") && accept == "text/event-stream" {
        // Tentative regardless of endpoint-event confirmation; the caller
        // re-classifies to the same value once the event is seen, which is
        // idempotent under the stickiness rule.
        return TransportType::HttpSse;
    }

    if signals.method == Some("POST")
        && accept.contains("application/json")
        && accept.contains("text/event-stream")
    {
        return TransportType::StreamableHttp;
    }

    // An `event: endpoint` body is a confirmed http_sse signal: it only
    // appears in the legacy two-endpoint handshake, so it overrides the
    // method-dependent weak inference below even on a POST connection.
    if signals.response_contains_endpoint_event {
        return TransportType::HttpSse;
    }

    if signals.is_sse_response {
        return match signals.method {
            Some("POST") => TransportType::StreamableHttp,
            _ => TransportType::HttpSse,
        };
    }

    TransportType::Unknown
}

/// Stateful per-connection and per-server-endpoint transport memory.
///
/// Classifications are sticky: once a 4-tuple or 2-tuple is classified to a
/// non-[`TransportType::Unknown`] value, later `unknown` signals never
/// overwrite it.
#[derive(Default)]
pub struct TransportTracker {
    connections: HashMap<ConnectionTuple, TransportType>,
    http_sse_servers: HashMap<ServerTuple, TransportType>,
}

impl TransportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh classification for `src -> dst`. Both directions of
    /// the tuple are updated, mirroring the source repo's reverse-key
    /// bookkeeping. `unknown` is never recorded (it can't overwrite a known
    /// value, and an never-before-seen connection is implicitly `unknown`
    /// via [`Self::get`]).
    pub fn update(
        &mut self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        transport: TransportType,
    ) {
        if transport == TransportType::Unknown {
            return;
        }

        let forward = (src_ip.to_string(), src_port, dst_ip.to_string(), dst_port);
        let reverse = (dst_ip.to_string(), dst_port, src_ip.to_string(), src_port);
        self.connections.insert(forward, transport);
        self.connections.insert(reverse, transport);

        if transport == TransportType::HttpSse {
            self.http_sse_servers
                .insert((dst_ip.to_string(), dst_port), transport);
        }
    }

    /// Resolve the classification for a connection: exact 4-tuple match
    /// first, then fall back to the server 2-tuple (either endpoint) for
    /// the HTTP+SSE two-endpoint pattern, else `unknown`.
    pub fn get(&self, src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> TransportType {
        let key = (src_ip.to_string(), src_port, dst_ip.to_string(), dst_port);
        if let Some(t) = self.connections.get(&key) {
            return *t;
        }

        if let Some(t) = self.http_sse_servers.get(&(dst_ip.to_string(), dst_port)) {
            return *t;
        }
        if let Some(t) = self.http_sse_servers.get(&(src_ip.to_string(), src_port)) {
            return *t;
        }

        TransportType::Unknown
    }
}
