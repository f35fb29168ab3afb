//! Opaque stream handler: relays a listener (optionally TLS-terminated)
//! straight to a configured target through the chosen dialer. No policy,
//! no auth.

use std::{str::FromStr, sync::Arc, time::Duration};

use http::Uri;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tracing::{debug, info, warn};

use crate::{
    config::StreamConfig,
    dialer::{BoxStream, DialerRegistry},
    listener::ConnHandler,
    request::RequestInfo,
    util::{MirrorConn, forward_bidi, sniff_client_hello_sni},
};

pub struct StreamHandler {
    network: String,
    target: String,
    dialer: String,
    dial_timeout: Option<Duration>,
    speed_limit: u64,
    dialers: Arc<DialerRegistry>,
}

impl StreamHandler {
    pub fn new(config: &StreamConfig, dialers: Arc<DialerRegistry>) -> Result<Self> {
        let (network, target) = parse_target(&config.proxy_pass)?;
        Ok(Self {
            network,
            target,
            dialer: config.dialer.clone(),
            dial_timeout: (config.dial_timeout > 0)
                .then(|| Duration::from_secs(config.dial_timeout)),
            speed_limit: config.speed_limit,
            dialers,
        })
    }
}

impl ConnHandler for StreamHandler {
    async fn serve<'a>(&'a self, stream: BoxStream, info: RequestInfo) -> Result<()> {
        let open = self.dialers.open_via(&self.dialer, &self.network, &self.target);
        let origin = match self.dial_timeout {
            Some(timeout) => tokio::time::timeout(timeout, open)
                .await
                .map_err(|_| anyerr!("dial timeout for {}", self.target))?,
            None => open.await,
        };
        let origin = match origin {
            Ok(origin) => origin,
            Err(err) => {
                warn!(target = %self.target, remote_ip = %info.remote_ip(), "stream dial failed: {err:#}");
                return Ok(());
            }
        };

        info!(
            target = %self.target,
            remote_ip = %info.remote_ip(),
            trace_id = %info.trace_id,
            "forward stream"
        );

        // mirror the first bytes so the client's TLS hello can be inspected
        // even though the relay is opaque
        let mut client = MirrorConn::new(stream);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin);
        let result = {
            let (mut client_read, mut client_write) = tokio::io::split(&mut client);
            forward_bidi(
                &mut client_read,
                &mut client_write,
                &mut origin_read,
                &mut origin_write,
                self.speed_limit,
            )
            .await
        };
        let (up, down) = result?;
        debug!(
            up,
            down,
            sni = sniff_client_hello_sni(client.header()).as_deref().unwrap_or(""),
            "stream relay finished"
        );
        Ok(())
    }
}

/// Splits `proxy_pass` into (network, address): bare `host:port`,
/// `unix:///path` and `scheme://host:port` forms.
fn parse_target(proxy_pass: &str) -> Result<(String, String)> {
    if !proxy_pass.contains("://") {
        return Ok(("tcp".to_string(), proxy_pass.to_string()));
    }
    let uri = Uri::from_str(proxy_pass).std_context("invalid stream proxy_pass")?;
    match uri.scheme_str() {
        Some(scheme @ ("unix" | "unixgram")) => {
            Ok((scheme.to_string(), uri.path().to_string()))
        }
        Some(_) => {
            let authority = uri
                .authority()
                .context("stream proxy_pass requires host:port")?;
            Ok(("tcp".to_string(), authority.as_str().to_string()))
        }
        None => Ok(("tcp".to_string(), proxy_pass.to_string())),
    }
}
