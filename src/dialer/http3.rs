//! HTTP/3 CONNECT dialer over QUIC.
//!
//! A single lazily constructed h3 client connection, keyed on first use.
//! CONNECT request streams stay open for the lifetime of the tunnel; the
//! stream halves are pumped into an in-process duplex pipe that the relay
//! machinery consumes as an ordinary byte stream.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Buf, Bytes};
use http::{Method, Request, StatusCode, Uri};
use n0_error::{Result, StdResultExt, anyerr, e};
use quinn::crypto::rustls::QuicClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{DEFAULT_USER_AGENT, parse};

use super::{DialError, Dialer, DialerSpec, ProxyStream, tls};

/// Concurrent stream budget granted to the QUIC connection.
const MAX_INCOMING_STREAMS: u32 = 200;

const PIPE_BUFFER: usize = 64 * 1024;

type H3Client = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

pub struct Http3Dialer {
    host: String,
    port: u16,
    username: String,
    password: String,
    resolve: Option<String>,
    transport: tokio::sync::Mutex<Option<H3Client>>,
}

impl Http3Dialer {
    pub(crate) fn new(spec: DialerSpec) -> Result<Self> {
        Ok(Self {
            resolve: spec.query.get("resolve").cloned(),
            host: spec.host,
            port: spec.port,
            username: spec.username,
            password: spec.password,
            transport: tokio::sync::Mutex::new(None),
        })
    }

    async fn client(&self) -> Result<H3Client, DialError> {
        let mut guard = self.transport.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = self.connect().await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn reset(&self) {
        *self.transport.lock().await = None;
    }

    async fn connect(&self) -> Result<H3Client, DialError> {
        let proxy_addr = format!("{}:{}", self.host, self.port);

        let dial_host = self.resolve.clone().unwrap_or_else(|| self.host.clone());
        let remote: SocketAddr = tokio::net::lookup_host((dial_host.as_str(), self.port))
            .await
            .map_err(|source| {
                e!(DialError::Unreachable {
                    addr: proxy_addr.clone(),
                    source
                })
            })?
            .next()
            .ok_or_else(|| {
                DialError::protocol(&proxy_addr, anyerr!("no addresses resolved"))
            })?;

        let mut tls_config =
            rustls::ClientConfig::clone(&tls::client_config(&[b"h3"], false));
        tls_config.enable_early_data = true;
        let quic_config = QuicClientConfig::try_from(tls_config)
            .map_err(|err| DialError::protocol(&proxy_addr, anyerr!(err)))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_config));
        let mut transport = quinn::TransportConfig::default();
        transport.max_concurrent_bidi_streams(MAX_INCOMING_STREAMS.into());
        transport.max_concurrent_uni_streams(MAX_INCOMING_STREAMS.into());
        transport.max_idle_timeout(None);
        transport.keep_alive_interval(Some(Duration::from_secs(15)));
        client_config.transport_config(Arc::new(transport));

        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let mut endpoint = quinn::Endpoint::client(bind).map_err(|source| {
            e!(DialError::Unreachable {
                addr: proxy_addr.clone(),
                source
            })
        })?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(remote, &self.host)
            .map_err(|err| DialError::protocol(&proxy_addr, anyerr!(err)))?
            .await
            .map_err(|err| DialError::protocol(&proxy_addr, anyerr!(err)))?;

        let (mut driver, client) = h3::client::new(h3_quinn::Connection::new(connection))
            .await
            .map_err(|err| DialError::protocol(&proxy_addr, anyerr!(err)))?;
        tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
            debug!("http3 transport closed");
            drop(endpoint);
        });
        debug!(host = %self.host, "constructed http3 transport");
        Ok(client)
    }

    fn connect_request(&self, addr: &str) -> Result<Request<()>> {
        let authority: http::uri::Authority =
            addr.parse().std_context("invalid CONNECT target")?;
        let uri = Uri::builder()
            .authority(authority)
            .build()
            .std_context("invalid CONNECT target")?;
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

impl Dialer for Http3Dialer {
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

        let request = self
            .connect_request(addr)
            .map_err(|err| DialError::protocol(addr, err))?;

        let mut client = self.client().await?;
        let mut stream = match client.send_request(request).await {
            Ok(stream) => stream,
            Err(_) => {
                // the lazy transport died; rebuild it once
                self.reset().await;
                let request = self
                    .connect_request(addr)
                    .map_err(|err| DialError::protocol(addr, err))?;
                self.client()
                    .await?
                    .send_request(request)
                    .await
                    .map_err(|err| DialError::protocol(addr, anyerr!(err)))?
            }
        };

        let response = stream
            .recv_response()
            .await
            .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;
        if response.status() != StatusCode::OK {
            return Err(e!(DialError::UpstreamRejected {
                via: format!("{}:{}", self.host, self.port),
                addr: addr.to_string(),
                reason: response.status().to_string(),
            }));
        }

        // The CONNECT request stream stays open; bridge it onto a duplex
        // pipe so the relay side sees a plain byte stream.
        let (local, pipe) = tokio::io::duplex(PIPE_BUFFER);
        let (mut send_half, mut recv_half) = stream.split();
        let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match pipe_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if send_half
                            .send_data(Bytes::copy_from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let _ = send_half.finish().await;
        });

        tokio::spawn(async move {
            loop {
                match recv_half.recv_data().await {
                    Ok(Some(mut chunk)) => {
                        let bytes = chunk.copy_to_bytes(chunk.remaining());
                        if pipe_write.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = pipe_write.shutdown().await;
        });

        Ok(ProxyStream::new(local))
    }
}
