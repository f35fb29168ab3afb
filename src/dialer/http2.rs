//! Pooled HTTP/2 CONNECT dialer.
//!
//! A fixed array of lazily constructed h2 client connections to the same
//! proxy; each dial picks a random live slot. Slots are guarded
//! individually so first-time construction of one slot never blocks the
//! others, and the first constructor wins.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use n0_error::{Result, StdResultExt, anyerr, e};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{DEFAULT_USER_AGENT, parse};

use super::{DialError, Dialer, DialerSpec, DirectDialer, ProxyStream, tls};

/// Upper bound on pool slots; `max_clients` is clamped to this.
const MAX_SLOTS: usize = 64;

const DEFAULT_MAX_CLIENTS: usize = 8;

type H2Client = h2::client::SendRequest<Bytes>;

pub struct Http2Dialer {
    host: String,
    port: u16,
    username: String,
    password: String,
    connector: TlsConnector,
    max_clients: usize,
    slots: Vec<tokio::sync::Mutex<Option<H2Client>>>,
    inner: DirectDialer,
}

impl Http2Dialer {
    pub(crate) fn new(spec: DialerSpec, inner: DirectDialer) -> Result<Self> {
        let config: Arc<ClientConfig> = match (
            spec.query.get("ca"),
            spec.query.get("cert"),
            spec.query.get("key"),
        ) {
            (Some(ca), Some(cert), Some(key)) => {
                tls::client_mtls_config(&[b"h2"], ca, cert, key)?
            }
            _ => tls::client_config(
                &[b"h2"],
                spec.query.get("insecure").is_some_and(|v| v == "true"),
            ),
        };
        let max_clients = spec
            .query
            .get("max_clients")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CLIENTS)
            .clamp(1, MAX_SLOTS);
        Ok(Self {
            host: spec.host,
            port: spec.port,
            username: spec.username,
            password: spec.password,
            connector: TlsConnector::from(config),
            max_clients,
            slots: (0..MAX_SLOTS).map(|_| tokio::sync::Mutex::new(None)).collect(),
            inner,
        })
    }

    /// Returns the slot's client, constructing it under the slot mutex when
    /// absent. Only the chosen slot is locked, so concurrent first-time
    /// dials on other slots proceed independently.
    async fn client_for_slot(&self, n: usize) -> Result<H2Client, DialError> {
        let mut slot = self.slots[n].lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = self.connect_transport().await?;
        debug!(slot = n, host = %self.host, "constructed http2 transport");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// A dead transport is detected on use; the slot is cleared so the next
    /// dial reconstructs it.
    async fn clear_slot(&self, n: usize) {
        *self.slots[n].lock().await = None;
    }

    async fn connect_transport(&self) -> Result<H2Client, DialError> {
        let proxy_addr = format!("{}:{}", self.host, self.port);
        let tcp = self.inner.dial_tcp(&proxy_addr).await?;
        let name = tls::server_name(&self.host)
            .map_err(|err| DialError::protocol(&proxy_addr, err))?;
        let tls_stream = self.connector.connect(name, tcp).await.map_err(|source| {
            e!(DialError::Unreachable {
                addr: proxy_addr.clone(),
                source
            })
        })?;
        let (client, connection) = h2::client::handshake(tls_stream)
            .await
            .map_err(|err| DialError::protocol(&proxy_addr, anyerr!(err)))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("http2 transport closed: {err}");
            }
        });
        Ok(client)
    }

    fn connect_request(&self, addr: &str) -> Result<Request<()>> {
        let uri = Uri::from_str_authority(addr)?;
        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(uri)
            .header("user-agent", DEFAULT_USER_AGENT);
        if !self.username.is_empty() {
            builder = builder.header(
                "proxy-authorization",
                parse::basic_authorization(&self.username, &self.password),
            );
        }
        builder.body(()).anyerr()
    }
}

trait UriExt {
    fn from_str_authority(s: &str) -> Result<Uri>;
}

impl UriExt for Uri {
    fn from_str_authority(s: &str) -> Result<Uri> {
        let authority: http::uri::Authority = s.parse().std_context("invalid CONNECT target")?;
        Uri::builder()
            .authority(authority)
            .build()
            .std_context("invalid CONNECT target")
    }
}

impl Dialer for Http2Dialer {
    async fn open<'a>(
        &'a self,
        network: &'a str,
        addr: &'a str,
    ) -> Result<ProxyStream, DialError> {
        if network != "tcp" {
            return Err(e!(DialError::UnsupportedNetwork {
                network: network.to_string()
            }));
        }

        let n = rand::random_range(0..self.max_clients);
        let client = self.client_for_slot(n).await?;

        let ready = match client.ready().await {
            Ok(ready) => ready,
            Err(_) => {
                // stale transport in the slot; reconstruct once
                self.clear_slot(n).await;
                let client = self.client_for_slot(n).await?;
                client
                    .ready()
                    .await
                    .map_err(|err| DialError::protocol(addr, anyerr!(err)))?
            }
        };
        let mut ready = ready;

        let request = self
            .connect_request(addr)
            .map_err(|err| DialError::protocol(addr, err))?;
        let (response, send) = ready
            .send_request(request, false)
            .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;
        let response = response
            .await
            .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;
        if response.status() != StatusCode::OK {
            return Err(e!(DialError::UpstreamRejected {
                via: format!("{}:{}", self.host, self.port),
                addr: addr.to_string(),
                reason: response.status().to_string(),
            }));
        }
        let recv = response.into_body();
        Ok(ProxyStream::new(Http2Stream::new(send, recv)))
    }
}

/// An open CONNECT stream on an h2 transport.
///
/// Reads drain the response body and release flow-control capacity; writes
/// reserve send capacity before pushing data frames. Shutdown sends the
/// end-of-stream frame.
pub(crate) struct Http2Stream {
    send: h2::SendStream<Bytes>,
    recv: Option<h2::RecvStream>,
    buffer: Bytes,
    read_done: bool,
}

impl Http2Stream {
    pub(crate) fn new(send: h2::SendStream<Bytes>, recv: h2::RecvStream) -> Self {
        Self {
            send,
            recv: Some(recv),
            buffer: Bytes::new(),
            read_done: false,
        }
    }

    /// Send-only adapter for response bodies; reads report EOF.
    pub(crate) fn for_response(send: h2::SendStream<Bytes>) -> Self {
        Self {
            send,
            recv: None,
            buffer: Bytes::new(),
            read_done: true,
        }
    }
}

impl AsyncRead for Http2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_done && this.buffer.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if this.buffer.is_empty() {
            let recv = this.recv.as_mut().expect("read_done implies recv");
            match Pin::new(recv).poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => this.buffer = bytes,
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(io::Error::other(err)));
                }
                Poll::Ready(None) => {
                    this.read_done = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
        let n = this.buffer.len().min(out.remaining());
        if n > 0 {
            let chunk = this.buffer.split_to(n);
            out.put_slice(&chunk);
            if let Some(recv) = this.recv.as_mut() {
                let _ = recv.flow_control().release_capacity(n);
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Http2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.send.reserve_capacity(buf.len());
        let capacity = loop {
            match this.send.capacity() {
                0 => match std::task::ready!(this.send.poll_capacity(cx)) {
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
                    None => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "http2 send stream closed",
                        )));
                    }
                },
                n => break n,
            }
        };
        let n = capacity.min(buf.len());
        this.send
            .send_data(Bytes::copy_from_slice(&buf[..n]), false)
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.send
            .send_data(Bytes::new(), true)
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(()))
    }
}
