//! Reverse-tunnel client.
//!
//! Maintains a persistent outbound connection to a remote edge. Over SSH
//! the edge opens a remote TCP listener and forwards its connections back;
//! over HTTP(S)/WebSocket the client performs the reverse-tunnel upgrade
//! and then speaks yamux in server mode, accepting streams the edge
//! originates. Each accepted stream is bridged to the configured local
//! target, or injected into a registered in-process listener.

use std::{net::IpAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType, rdata::svcb::SvcParamValue};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use rand::Rng as _;
use russh::client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_USER_AGENT,
    config::TunnelConfig,
    dialer::{BoxStream, Dialer, DialerRegistry, DialerSpec, DirectDialer, ssh::connect_ssh, tls},
    mux::MuxSession,
    parse::{HttpResponse, basic_authorization},
    util::{MemoryListener, Prebuffered, forward_bidi},
};

/// Reconnect backoff bounds between tunnel attempts.
const BACKOFF_MIN: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(14);

/// TCP keepalive on the tunnel transport.
const TRANSPORT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Cap on the upgrade response head.
const RESPONSE_HEAD_MAX: usize = 8192;

/// In-process listeners keyed by the tunnel's remote listen address.
///
/// When a tunnel's address is registered here, accepted tunnel streams are
/// queued for another handler's accept loop instead of being bridged to
/// the local target.
#[derive(Default)]
pub struct MemoryListeners(DashMap<String, Arc<MemoryListener<BoxStream>>>);

impl MemoryListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or returns) the listener for `addr`.
    pub fn register(&self, addr: &str) -> Arc<MemoryListener<BoxStream>> {
        self.0
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(MemoryListener::new()))
            .clone()
    }

    fn get(&self, addr: &str) -> Option<Arc<MemoryListener<BoxStream>>> {
        self.0.get(addr).map(|entry| entry.value().clone())
    }
}

pub struct TunnelClient {
    config: TunnelConfig,
    dialer_url: String,
    dialers: Arc<DialerRegistry>,
    memory_listeners: Arc<MemoryListeners>,
}

impl TunnelClient {
    pub fn new(
        config: TunnelConfig,
        dialers: Arc<DialerRegistry>,
        memory_listeners: Arc<MemoryListeners>,
    ) -> Result<Self> {
        let dialer_url = dialers
            .raw(&config.dialer)
            .context(format!("tunnel dialer {:?} is not defined", config.dialer))?
            .to_string();
        Ok(Self {
            config,
            dialer_url,
            dialers,
            memory_listeners,
        })
    }

    /// Runs the tunnel until cancelled, reconnecting with a randomized
    /// backoff after every failure or disconnect.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let result = match DialerSpec::parse(&self.dialer_url) {
                Err(err) => {
                    warn!(dialer = %self.dialer_url, "invalid tunnel dialer: {err:#}");
                    return;
                }
                Ok(spec) => match spec.scheme.as_str() {
                    "ssh" | "ssh2" => self.run_ssh(&spec, &shutdown).await,
                    "http" | "https" | "ws" | "wss" => self.run_ws(&spec, &shutdown).await,
                    other => {
                        warn!(scheme = other, "tunnel dialer scheme is unsupported");
                        return;
                    }
                },
            };
            if let Err(err) = result {
                warn!(listen = %self.listen_addr(), "tunnel attempt failed: {err:#}");
            }

            let delay = rand::rng().random_range(BACKOFF_MIN..=BACKOFF_MAX);
            info!(?delay, "tunnel reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    fn listen_addr(&self) -> &str {
        &self.config.listen[0]
    }

    fn dial_timeout(&self) -> Option<Duration> {
        (self.config.dial_timeout > 0).then(|| Duration::from_secs(self.config.dial_timeout))
    }

    fn transport_dialer(&self) -> DirectDialer {
        DirectDialer {
            timeout: self.dial_timeout(),
            keepalive: Some(TRANSPORT_KEEPALIVE),
            ..Default::default()
        }
    }

    // -- SSH transport --

    async fn run_ssh(&self, spec: &DialerSpec, shutdown: &CancellationToken) -> Result<()> {
        if spec.username.is_empty() {
            return Err(anyerr!("no user info in tunnel dialer"));
        }
        info!(host = %spec.hostport(), "connecting ssh tunnel host");

        let dial_host = spec
            .query
            .get("resolve")
            .cloned()
            .unwrap_or_else(|| spec.host.clone());
        let addr = format!("{}:{}", dial_host, spec.port);

        let (forward_tx, mut forward_rx) = tokio::sync::mpsc::channel(64);
        let mut handle = connect_ssh(
            &self.transport_dialer(),
            &addr,
            &spec.username,
            &spec.password,
            spec.query.get("key").map(String::as_str),
            ForwardingHandler { forwards: forward_tx },
        )
        .await
        .map_err(|err| anyerr!(err))?;

        let (listen_host, listen_port) = self
            .listen_addr()
            .rsplit_once(':')
            .context("invalid tunnel listen address")?;
        let listen_port: u32 = listen_port.parse().std_context("invalid tunnel listen port")?;
        let forwarded = handle
            .tcpip_forward(listen_host, listen_port)
            .await
            .map_err(|err| anyerr!(err))?;
        if !forwarded {
            return Err(anyerr!("remote refused tcpip-forward for {}", self.listen_addr()));
        }
        info!(listen = %self.listen_addr(), "listening on remote via ssh");

        loop {
            tokio::select! {
                channel = forward_rx.recv() => {
                    let Some(channel) = channel else {
                        return Err(anyerr!("ssh tunnel transport closed"));
                    };
                    self.dispatch(Box::new(channel.into_stream())).await;
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    // -- WebSocket / HTTP upgrade transport --

    async fn run_ws(&self, spec: &DialerSpec, shutdown: &CancellationToken) -> Result<()> {
        if spec.username.is_empty() {
            return Err(anyerr!("no user info in tunnel dialer"));
        }
        info!(host = %spec.hostport(), "connecting tunnel host");

        // optional ECH: HTTPS records carry the config list and IP hints
        let mut dial_host = spec.host.clone();
        let mut ech_config: Option<Vec<u8>> = None;
        if spec.query.get("ech").is_some_and(|v| v == "true") {
            let https = lookup_https_record(&self.config.dns_server, &spec.host).await?;
            debug!(host = %spec.host, ech = https.ech.is_some(), "looked up https record");
            ech_config = https.ech;
            if let Some(hint) = https.ipv4_hint.map(IpAddr::from).or(https.ipv6_hint.map(IpAddr::from)) {
                dial_host = hint.to_string();
            }
        }
        if let Some(resolve) = spec.query.get("resolve") {
            dial_host = resolve.clone();
        }

        let addr = format!("{}:{}", dial_host, spec.port);
        let tcp = self
            .transport_dialer()
            .dial_tcp(&addr)
            .await
            .map_err(|err| anyerr!(err))?;

        let transport: BoxStream = match spec.scheme.as_str() {
            "https" | "wss" => {
                let insecure = spec.query.get("insecure").is_some_and(|v| v == "true");
                let config = match ech_config {
                    Some(list) => ech_client_config(list)?,
                    None => tls::client_config(&[b"http/1.1"], insecure),
                };
                let name = tls::server_name(&spec.host)?;
                let stream = TlsConnector::from(config)
                    .connect(name, tcp)
                    .await
                    .std_context("tunnel tls handshake failed")?;
                Box::new(stream)
            }
            _ => Box::new(tcp),
        };

        let transport = self.upgrade(spec, transport).await?;
        info!(listen = %self.listen_addr(), "listening on remote via reverse tunnel");

        let session = MuxSession::server(transport);
        loop {
            tokio::select! {
                stream = session.accept() => {
                    let Some(stream) = stream else {
                        return Err(anyerr!("tunnel transport closed"));
                    };
                    self.dispatch(Box::new(stream)).await;
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Sends the reverse-tunnel upgrade request and validates the response,
    /// preserving any bytes the server sent past the header section.
    async fn upgrade(&self, spec: &DialerSpec, mut transport: BoxStream) -> Result<BoxStream> {
        let (listen_host, listen_port) = self
            .listen_addr()
            .rsplit_once(':')
            .context("invalid tunnel listen address")?;

        // see draft-kazuho-httpbis-reverse-tunnel
        let mut request = format!(
            "GET /.well-known/reverse/tcp/{listen_host}/{listen_port}/ HTTP/1.1\r\n"
        );
        request.push_str(&format!("Host: {}\r\n", spec.host));
        request.push_str(&format!(
            "Authorization: {}\r\n",
            basic_authorization(&spec.username, &spec.password)
        ));
        request.push_str(&format!("User-Agent: {DEFAULT_USER_AGENT}\r\n"));
        request.push_str("Connection: Upgrade\r\n");
        match spec.scheme.as_str() {
            "ws" | "wss" => {
                let key: [u8; 16] = rand::rng().random();
                request.push_str("Upgrade: websocket\r\n");
                request.push_str("Sec-WebSocket-Version: 13\r\n");
                request.push_str(&format!(
                    "Sec-WebSocket-Key: {}\r\n",
                    {
                        use base64::Engine as _;
                        base64::engine::general_purpose::STANDARD.encode(key)
                    }
                ));
            }
            _ => {
                request.push_str("Upgrade: reverse\r\n");
            }
        }
        request.push_str("\r\n");

        debug!(listen = %self.listen_addr(), "sending tunnel upgrade request");
        transport.write_all(request.as_bytes()).await.anyerr()?;

        // read the response head; bytes past the blank line already belong
        // to the mux layer
        let mut head = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        let leftover = loop {
            let n = transport.read(&mut chunk).await.anyerr()?;
            if n == 0 {
                return Err(anyerr!("tunnel host closed during upgrade"));
            }
            head.extend_from_slice(&chunk[..n]);
            if let Some(i) = find_header_end(&head) {
                break head.split_off(i);
            }
            if head.len() > RESPONSE_HEAD_MAX {
                return Err(anyerr!("tunnel upgrade response head too large"));
            }
        };

        let (_, response) = HttpResponse::parse_with_len(&head)?
            .context("incomplete tunnel upgrade response")?;
        if response.status.as_u16() != 101 && response.status.as_u16() != 200 {
            return Err(anyerr!(
                "tunnel upgrade to {} refused: {} {}",
                self.listen_addr(),
                response.status.as_u16(),
                response.reason()
            ));
        }

        Ok(Box::new(Prebuffered::with_prefix(leftover, transport)))
    }

    /// Hands one accepted tunnel connection to its consumer: a registered
    /// in-process listener when one exists, otherwise a bridge to the
    /// configured local target.
    async fn dispatch(&self, stream: BoxStream) {
        if let Some(listener) = self.memory_listeners.get(self.listen_addr()) {
            debug!(listen = %self.listen_addr(), "queueing tunnel stream on memory listener");
            if !listener.add(stream).await {
                debug!("memory listener is closed, dropping tunnel stream");
            }
            return;
        }

        let target = self.config.proxy_pass.clone();
        let dialers = self.dialers.clone();
        let timeout = self.dial_timeout();
        tokio::spawn(async move {
            if let Err(err) = bridge_to_local(dialers, &target, stream, timeout).await {
                warn!(target = %target, "tunnel bridge failed: {err:#}");
            }
        });
    }
}

/// Connects the local target and pipes the tunnel stream into it.
async fn bridge_to_local(
    dialers: Arc<DialerRegistry>,
    target: &str,
    stream: BoxStream,
    timeout: Option<Duration>,
) -> Result<()> {
    let open = dialers.local().open("tcp", target);
    let local = match timeout {
        Some(duration) => tokio::time::timeout(duration, open)
            .await
            .map_err(|_| anyerr!("dial timeout for {target}"))??,
        None => open.await?,
    };
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);
    let (mut local_read, mut local_write) = tokio::io::split(local);
    forward_bidi(
        &mut remote_read,
        &mut remote_write,
        &mut local_read,
        &mut local_write,
        0,
    )
    .await?;
    Ok(())
}

/// russh handler that queues channels forwarded from the remote listener.
struct ForwardingHandler {
    forwards: tokio::sync::mpsc::Sender<russh::Channel<client::Msg>>,
}

#[async_trait::async_trait]
impl client::Handler for ForwardingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // host key checks are disabled: the tunnel payload is opaque
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.forwards.send(channel).await.ok();
        Ok(())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

struct HttpsRecord {
    ech: Option<Vec<u8>>,
    ipv4_hint: Option<std::net::Ipv4Addr>,
    ipv6_hint: Option<std::net::Ipv6Addr>,
}

/// Resolves the HTTPS (SVCB) record for `host` per RFC 9460.
async fn lookup_https_record(dns_server: &str, host: &str) -> Result<HttpsRecord> {
    let resolver = build_resolver(dns_server)?;
    let lookup = resolver
        .lookup(host, RecordType::HTTPS)
        .await
        .std_context(format!("https record lookup for {host} failed"))?;

    let mut record = HttpsRecord {
        ech: None,
        ipv4_hint: None,
        ipv6_hint: None,
    };
    for rdata in lookup.iter() {
        let RData::HTTPS(https) = rdata else {
            continue;
        };
        for (_key, value) in https.svc_params() {
            match value {
                SvcParamValue::EchConfigList(list) => {
                    if !list.0.is_empty() {
                        record.ech = Some(list.0.clone());
                    }
                }
                SvcParamValue::Ipv4Hint(hint) => {
                    record.ipv4_hint = hint.0.first().map(|a| a.0);
                }
                SvcParamValue::Ipv6Hint(hint) => {
                    record.ipv6_hint = hint.0.first().map(|a| a.0);
                }
                _ => {}
            }
        }
        if record.ech.is_some() {
            break;
        }
    }
    if record.ech.is_none() && record.ipv4_hint.is_none() && record.ipv6_hint.is_none() {
        return Err(anyerr!("empty https record for {host}"));
    }
    Ok(record)
}

fn build_resolver(dns_server: &str) -> Result<TokioAsyncResolver> {
    if dns_server.is_empty() {
        return TokioAsyncResolver::tokio_from_system_conf()
            .std_context("failed to load system resolver");
    }
    let (host, port) = match dns_server.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().std_context("invalid dns port")?),
        None => (dns_server, 53),
    };
    let ip: IpAddr = host.parse().std_context("dns_server must be an ip address")?;
    let config = ResolverConfig::from_parts(
        None,
        Vec::new(),
        NameServerConfigGroup::from_ips_clear(&[ip], port, true),
    );
    Ok(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
}

/// TLS 1.3 client config with Encrypted Client Hello enabled from a DNS
/// config list.
fn ech_client_config(list: Vec<u8>) -> Result<Arc<rustls::ClientConfig>> {
    use rustls::client::{EchConfig, EchMode};
    use rustls::pki_types::EchConfigListBytes;

    let suites = rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES;
    let ech = EchConfig::new(EchConfigListBytes::from(list), suites)
        .std_context("invalid ech config list")?;
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let mut config = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_ech(EchMode::from(ech))
        .std_context("failed to enable ech")?
        .with_root_certificates(tls::webpki_roots())
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"HTTP/1.1 101 S\r\n\r\n"), Some(18));
        assert_eq!(find_header_end(b"HTTP/1.1 101 S\r\n\r\nXYZ"), Some(18));
        assert_eq!(find_header_end(b"HTTP/1.1 101 S\r\n"), None);
    }

    #[test]
    fn backoff_bounds_are_sane() {
        for _ in 0..100 {
            let delay = rand::rng().random_range(BACKOFF_MIN..=BACKOFF_MAX);
            assert!(delay >= BACKOFF_MIN && delay <= BACKOFF_MAX);
        }
    }
}
