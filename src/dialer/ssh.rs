//! SSH dialer: direct-tcpip channels over a shared client connection.

use std::{sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt, anyerr, e};
use russh::client;
use tracing::debug;

use super::{DialError, Dialer, DialerSpec, DirectDialer, ProxyStream};

pub struct SshDialer {
    host: String,
    port: u16,
    username: String,
    password: String,
    keyfile: Option<String>,
    inner: DirectDialer,
    /// Shared control connection; channel opens are serialized on it and a
    /// closed connection is replaced on the next dial.
    control: tokio::sync::Mutex<Option<client::Handle<AcceptingHandler>>>,
}

/// Host-key verification is disabled: the tunnel payload is opaque and the
/// endpoint is operator-configured.
pub(crate) struct AcceptingHandler;

#[async_trait::async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl SshDialer {
    pub(crate) fn new(spec: DialerSpec, inner: DirectDialer) -> Result<Self> {
        if spec.username.is_empty() {
            return Err(anyerr!("ssh dialer requires user info"));
        }
        Ok(Self {
            keyfile: spec.query.get("key").cloned(),
            host: spec
                .query
                .get("resolve")
                .cloned()
                .unwrap_or_else(|| spec.host.clone()),
            port: spec.port,
            username: spec.username,
            password: spec.password,
            inner,
            control: tokio::sync::Mutex::new(None),
        })
    }

    fn proxy_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Dials the SSH endpoint and authenticates, private key first when
/// configured, then password.
pub(crate) async fn connect_ssh<H>(
    dialer: &DirectDialer,
    addr: &str,
    username: &str,
    password: &str,
    keyfile: Option<&str>,
    handler: H,
) -> Result<client::Handle<H>, DialError>
where
    H: client::Handler<Error = russh::Error> + 'static,
{
    let tcp = dialer.dial_tcp(addr).await?;

    let config = Arc::new(client::Config {
        inactivity_timeout: Some(Duration::from_secs(60)),
        ..Default::default()
    });
    let mut handle = client::connect_stream(config, tcp, handler)
        .await
        .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;

    let mut authenticated = false;
    if let Some(keyfile) = keyfile {
        let pem = std::fs::read_to_string(keyfile)
            .std_context(format!("failed to read ssh key {keyfile}"))
            .map_err(|err| DialError::protocol(addr, err))?;
        let key = russh_keys::decode_secret_key(&pem, None)
            .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;
        authenticated = handle
            .authenticate_publickey(username, Arc::new(key))
            .await
            .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;
    }
    if !authenticated {
        authenticated = handle
            .authenticate_password(username, password)
            .await
            .map_err(|err| DialError::protocol(addr, anyerr!(err)))?;
    }
    if !authenticated {
        return Err(e!(DialError::UpstreamRejected {
            via: addr.to_string(),
            addr: addr.to_string(),
            reason: "ssh authentication failed".to_string(),
        }));
    }
    Ok(handle)
}

impl Dialer for SshDialer {
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
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| DialError::protocol(addr, anyerr!("target must be host:port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DialError::protocol(addr, anyerr!("invalid target port")))?;

        let mut control = self.control.lock().await;
        if control.as_ref().is_none_or(|h| h.is_closed()) {
            let handle = connect_ssh(
                &self.inner,
                &self.proxy_addr(),
                &self.username,
                &self.password,
                self.keyfile.as_deref(),
                AcceptingHandler,
            )
            .await?;
            debug!(host = %self.host, "established ssh control connection");
            *control = Some(handle);
        }
        let handle = control.as_mut().expect("control connection just set");

        let channel = handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|err| {
                e!(DialError::UpstreamRejected {
                    via: self.proxy_addr(),
                    addr: addr.to_string(),
                    reason: format!("direct-tcpip open failed: {err}"),
                })
            })?;
        drop(control);
        Ok(ProxyStream::new(channel.into_stream()))
    }
}
