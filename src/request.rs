//! Per-connection request descriptors shared across handlers.

use std::net::SocketAddr;

use rand::RngCore;

/// Negotiated TLS parameters captured at accept time.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// Negotiated protocol version, e.g. `TLSv1.3`.
    pub version: Option<String>,
    /// Server name from the ClientHello, when sent.
    pub server_name: Option<String>,
    /// Cipher suite ids offered in the ClientHello.
    pub cipher_suites: Vec<u16>,
    /// Negotiated ALPN protocol.
    pub alpn: Option<String>,
}

/// Immutable descriptor of one inbound connection.
///
/// Built by the listener supervisor before the connection is handed to its
/// protocol handler; handlers enrich their own request state but never
/// mutate this.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Peer address of the accepted socket.
    pub remote_addr: SocketAddr,
    /// Local address the connection arrived on.
    pub server_addr: SocketAddr,
    /// Random per-connection id carried through log spans.
    pub trace_id: TraceId,
    /// Protocol tag, e.g. `http/1.1`, `h2`, `socks5`, `stream`.
    pub proto: &'static str,
    /// TLS parameters when the listener terminates TLS.
    pub tls: Option<TlsInfo>,
}

impl RequestInfo {
    pub fn new(remote_addr: SocketAddr, server_addr: SocketAddr, proto: &'static str) -> Self {
        Self {
            remote_addr,
            server_addr,
            trace_id: TraceId::new(),
            proto,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsInfo) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Remote IP without the ephemeral port.
    pub fn remote_ip(&self) -> std::net::IpAddr {
        self.remote_addr.ip()
    }

    /// Server name from TLS, when known.
    pub fn server_name(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.server_name.as_deref())
    }
}

/// Random 64-bit trace id, formatted as fixed-width hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("{_0:016x}")]
pub struct TraceId(u64);

impl TraceId {
    pub fn new() -> Self {
        Self(rand::rng().next_u64())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}
