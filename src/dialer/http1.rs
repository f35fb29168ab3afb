//! HTTP/1.1 CONNECT dialer.

use std::sync::Arc;

use http::StatusCode;
use n0_error::e;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::{
    DEFAULT_USER_AGENT, HEADER_SECTION_MAX_LENGTH,
    parse::{Authority, HttpResponse},
    util::Prebuffered,
};

use super::{Dialer, DialError, DialerSpec, DirectDialer, ProxyStream, tls};

/// Dials through an HTTP/1.1 proxy with `CONNECT host:port`, optionally
/// over TLS, with Basic proxy credentials. Expects a `200` handshake.
pub struct Http1Dialer {
    proxy: Authority,
    username: String,
    password: String,
    tls: Option<(TlsConnector, String)>,
    inner: DirectDialer,
}

impl Http1Dialer {
    pub(crate) fn new(
        spec: DialerSpec,
        inner: DirectDialer,
        use_tls: bool,
    ) -> n0_error::Result<Self> {
        let tls = use_tls.then(|| {
            let config: Arc<ClientConfig> = tls::client_config(
                &[b"http/1.1"],
                spec.query.get("insecure").is_some_and(|v| v == "true"),
            );
            (TlsConnector::from(config), spec.host.clone())
        });
        Ok(Self {
            proxy: Authority {
                host: spec.host.clone(),
                port: spec.port,
            },
            username: spec.username,
            password: spec.password,
            tls,
            inner,
        })
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        (!self.username.is_empty()).then_some((self.username.as_str(), self.password.as_str()))
    }
}

impl Dialer for Http1Dialer {
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

        let tcp = self.inner.dial_tcp(&self.proxy.to_addr()).await?;
        let local = tcp.local_addr().ok();
        let remote = tcp.peer_addr().ok();

        let target = Authority::from_authority_str(addr)
            .map_err(|err| DialError::protocol(addr, err))?;
        let request = target.to_connect_request(self.credentials(), DEFAULT_USER_AGENT);

        let stream = match &self.tls {
            None => {
                connect_handshake(tcp, &request, &self.proxy, addr).await?
            }
            Some((connector, host)) => {
                let name = tls::server_name(host)
                    .map_err(|err| DialError::protocol(addr, err))?;
                let tls_stream = connector.connect(name, tcp).await.map_err(|source| {
                    e!(DialError::Unreachable {
                        addr: self.proxy.to_addr(),
                        source
                    })
                })?;
                connect_handshake(tls_stream, &request, &self.proxy, addr).await?
            }
        };

        Ok(ProxyStream::new(stream).with_addrs(local, remote))
    }
}

/// Writes the CONNECT request, validates the `200` response and returns the
/// stream with any read-ahead bytes preserved.
async fn connect_handshake<S>(
    stream: S,
    request: &str,
    proxy: &Authority,
    addr: &str,
) -> Result<Box<dyn super::StreamIo>, DialError>
where
    S: super::StreamIo + 'static,
{
    use tokio::io::AsyncWriteExt;

    let (recv, mut send) = tokio::io::split(stream);
    send.write_all(request.as_bytes()).await.map_err(|source| {
        e!(DialError::Unreachable {
            addr: proxy.to_addr(),
            source
        })
    })?;

    let mut recv = Prebuffered::new(recv, HEADER_SECTION_MAX_LENGTH);
    let response = HttpResponse::read(&mut recv)
        .await
        .map_err(|err| DialError::protocol(addr, err))?;
    if response.status != StatusCode::OK {
        return Err(e!(DialError::UpstreamRejected {
            via: proxy.to_string(),
            addr: addr.to_string(),
            reason: format!("{} {}", response.status.as_u16(), response.reason()),
        }));
    }
    Ok(Box::new(tokio::io::join(recv, send)))
}
