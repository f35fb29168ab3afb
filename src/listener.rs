//! Listener supervisor: binds configured endpoints, prepares accepted
//! sockets (keepalive, TLS with ClientHello capture) and dispatches each
//! connection to its protocol handler on a fresh task.

use std::{sync::Arc, time::Duration};

use dynosaur::dynosaur;
use n0_error::Result;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    dialer::BoxStream,
    request::{RequestInfo, TlsInfo},
};

/// Pause after a transient accept failure before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[dynosaur(pub DynConnHandler = dyn(box) ConnHandler)]
/// Owns one accepted connection for its whole lifetime.
///
/// Implementations must close the stream on every exit path; returning the
/// error is for logging only.
pub trait ConnHandler: Send + Sync {
    fn serve<'a>(
        &'a self,
        stream: BoxStream,
        info: RequestInfo,
    ) -> impl Future<Output = Result<()>> + Send + 'a;
}

/// One configured listening endpoint.
pub struct ListenerSpec {
    pub addr: String,
    /// Protocol tag stamped into [`RequestInfo`].
    pub proto: &'static str,
    /// TLS server config; when set, connections are terminated here and
    /// the ClientHello is captured for policy input.
    pub tls: Option<Arc<ServerConfig>>,
    pub keepalive: Option<Duration>,
    pub handler: Arc<DynConnHandler<'static>>,
}

/// Binds the endpoint and accepts until cancelled.
///
/// Transient accept errors back off briefly and retry; a closed listener
/// or cancellation exits cleanly.
pub async fn serve(spec: ListenerSpec, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&spec.addr).await?;
    info!(addr = %spec.addr, proto = spec.proto, "listening");
    let spec = Arc::new(spec);

    let mut conn_id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => {
                debug!(addr = %spec.addr, "listener shutdown");
                return Ok(());
            }
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(addr = %spec.addr, "accept error: {err}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        conn_id += 1;
        let spec_for_task = spec.clone();
        tokio::spawn(
            async move {
                if let Err(err) = handle_accepted(&spec_for_task, stream, peer_addr).await {
                    debug!("connection closed with error: {err:#}");
                }
            }
            .instrument(error_span!("conn", id = conn_id, proto = spec.proto)),
        );
    }
}

async fn handle_accepted(
    spec: &ListenerSpec,
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
) -> Result<()> {
    let server_addr = stream.local_addr()?;
    if let Some(period) = spec.keepalive {
        let ka = socket2::TcpKeepalive::new().with_time(period);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&ka).ok();
    }

    let mut info = RequestInfo::new(peer_addr, server_addr, spec.proto);

    let stream: BoxStream = match &spec.tls {
        None => Box::new(stream),
        Some(config) => {
            let (stream, tls_info) = accept_tls(stream, config.clone()).await?;
            info = info.with_tls(tls_info);
            stream
        }
    };

    spec.handler.serve(stream, info).await
}

/// Runs the TLS server handshake, capturing ClientHello parameters before
/// the configuration is applied.
async fn accept_tls(
    stream: TcpStream,
    config: Arc<ServerConfig>,
) -> Result<(BoxStream, TlsInfo)> {
    let acceptor =
        tokio_rustls::LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;

    let mut tls_info = TlsInfo::default();
    {
        let client_hello = start.client_hello();
        tls_info.server_name = client_hello.server_name().map(str::to_string);
        tls_info.cipher_suites = client_hello
            .cipher_suites()
            .iter()
            .map(|cs| u16::from(*cs))
            .collect();
    }

    let stream = start.into_stream(config).await?;
    {
        let (_, connection) = stream.get_ref();
        tls_info.version = connection.protocol_version().map(|v| format!("{v:?}"));
        tls_info.alpn = connection
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
    }
    debug!(
        sni = tls_info.server_name.as_deref().unwrap_or(""),
        alpn = tls_info.alpn.as_deref().unwrap_or(""),
        "tls accepted"
    );
    Ok((Box::new(stream), tls_info))
}
