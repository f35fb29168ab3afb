//! Reverse-tunnel server handler.
//!
//! Accepts the inbound upgrade request on
//! `/.well-known/reverse/tcp/{host}/{port}/`, authenticates the user
//! against the CSV table, opens a local TCP listener at the requested
//! address, takes over the connection and runs a yamux client session on
//! it: every connection accepted on the listener is forwarded onto a fresh
//! tunnel stream.

use std::{sync::Arc, time::Duration};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};
use tracing::{debug, info, warn};

use crate::{
    WEBSOCKET_ACCEPT_GUID,
    auth::UserTable,
    config::TunnelServerConfig,
    mux::MuxSession,
    parse::{HttpRequest, HttpResponse},
    request::RequestInfo,
    util::{Prebuffered, forward_bidi},
};

/// Interval between keepalive probe streams.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Retry interval once a probe has failed.
const PROBE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive probe failures that kill the session.
const PROBE_FAILURE_LIMIT: u32 = 3;

pub struct TunnelServerHandler {
    users: UserTable,
    speed_limit: u64,
}

impl TunnelServerHandler {
    pub fn new(config: &TunnelServerConfig) -> Result<Self> {
        let users = UserTable::open(config.auth_table.as_str())
            .context("failed to load tunnel auth_table")?;
        Ok(Self {
            users,
            speed_limit: config.speed_limit,
        })
    }

    /// Drives one tunnel connection from upgrade to session teardown.
    pub(crate) async fn serve_upgrade<R, W>(
        &self,
        req: HttpRequest,
        reader: Prebuffered<R>,
        mut writer: W,
        info: &RequestInfo,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Basic credentials, both parts required
        let Some((username, password)) = req
            .basic_credentials("authorization")
            .filter(|(u, p)| !u.is_empty() && !p.is_empty())
        else {
            warn!(remote_ip = %info.remote_ip(), "tunnel authorization required");
            HttpResponse::with_reason(StatusCode::UNAUTHORIZED, "Authorization Required")
                .write_with_body(&mut writer)
                .await
                .anyerr()?;
            return Ok(());
        };

        let user = match self.users.verify(&username, &password) {
            Ok(user) => user,
            Err(err) => {
                warn!(remote_ip = %info.remote_ip(), username, "tunnel auth failed: {err:#}");
                HttpResponse::with_reason(StatusCode::UNAUTHORIZED, "Authorization Required")
                    .write_with_body(&mut writer)
                    .await
                    .anyerr()?;
                return Ok(());
            }
        };
        if user.attr("allow_tunnel") != Some("1") {
            warn!(remote_ip = %info.remote_ip(), username, "tunnel permission denied");
            HttpResponse::with_reason(StatusCode::FORBIDDEN, "permission denied")
                .write_with_body(&mut writer)
                .await
                .anyerr()?;
            return Ok(());
        }

        // path: /.well-known/reverse/tcp/{host}/{port}/
        let Some(addr) = parse_tunnel_path(&req.target) else {
            HttpResponse::with_reason(StatusCode::BAD_REQUEST, "Bad Request")
                .write_with_body(&mut writer)
                .await
                .anyerr()?;
            return Ok(());
        };

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(addr = %addr, "tunnel listener bind failed: {err}");
                HttpResponse::with_reason(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                    .write_with_body(&mut writer)
                    .await
                    .anyerr()?;
                return Ok(());
            }
        };
        info!(remote_ip = %info.remote_ip(), username, addr = %addr, "tunnel listener open");

        // from here the connection is ours: emit the upgrade response and
        // switch to yamux framing
        let response = upgrade_response(&req);
        writer.write_all(response.as_bytes()).await.anyerr()?;

        let transport = tokio::io::join(reader, writer);
        let session = Arc::new(MuxSession::client(transport));

        let accept_loop = accept_loop(listener, session.clone(), self.speed_limit);
        let prober = probe_loop(session.clone());
        tokio::select! {
            result = accept_loop => {
                debug!("tunnel accept loop ended: {result:?}");
            }
            _ = prober => {
                warn!(addr = %addr, "tunnel session failed keepalive probes");
            }
        }
        info!(addr = %addr, username, "tunnel closed");
        Ok(())
    }
}

/// Parses `/.well-known/reverse/tcp/{host}/{port}/` into `host:port`.
fn parse_tunnel_path(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    let host = parts[parts.len() - 3];
    let port: u16 = parts[parts.len() - 2].parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{host}:{port}"))
}

/// Builds the upgrade response per the reverse-HTTP-tunnel draft: `101`
/// mirroring the requested protocol for upgrade requests, `200` otherwise.
fn upgrade_response(req: &HttpRequest) -> String {
    let connection_upgrade = req
        .header("connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"));
    if !connection_upgrade {
        return "HTTP/1.1 200 OK\r\n\r\n".to_string();
    }
    let mut response = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    match req.header("upgrade") {
        Some("websocket") => {
            let key = req.header("sec-websocket-key").unwrap_or("");
            response.push_str(&format!(
                "sec-websocket-accept: {}\r\n",
                websocket_accept(key)
            ));
            response.push_str("connection: Upgrade\r\n");
            response.push_str("upgrade: websocket\r\n");
        }
        Some("reverse") => {
            response.push_str("connection: Upgrade\r\n");
            response.push_str("upgrade: reverse\r\n");
        }
        _ => {}
    }
    response.push_str("\r\n");
    response
}

/// `base64(SHA1(key || GUID))` per RFC 6455.
pub(crate) fn websocket_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Forwards each accepted external connection onto a new session stream.
async fn accept_loop(
    listener: TcpListener,
    session: Arc<MuxSession>,
    speed_limit: u64,
) -> Result<()> {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("tunnel accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let stream = match session.open().await {
            Ok(stream) => stream,
            Err(err) => {
                return Err(anyerr!("tunnel session open failed: {err:#}"));
            }
        };
        debug!(peer = %peer, "tunnel forwarding");
        tokio::spawn(async move {
            let (mut conn_read, mut conn_write) = conn.into_split();
            let (mut stream_read, mut stream_write) = tokio::io::split(stream);
            if let Err(err) = forward_bidi(
                &mut conn_read,
                &mut conn_write,
                &mut stream_read,
                &mut stream_write,
                speed_limit,
            )
            .await
            {
                debug!("tunnel stream finished with error: {err:#}");
            }
        });
    }
}

/// Opens and closes a probe stream on an interval; returns after
/// [`PROBE_FAILURE_LIMIT`] consecutive failures.
///
/// This catches transports that stall without erroring, which the mux
/// layer alone reports as healthy.
async fn probe_loop(session: Arc<MuxSession>) {
    let mut failures = 0;
    let mut interval = PROBE_INTERVAL;
    loop {
        tokio::time::sleep(interval).await;
        match session.open().await {
            Ok(stream) => {
                drop(stream);
                failures = 0;
                interval = PROBE_INTERVAL;
            }
            Err(_) => {
                failures += 1;
                interval = PROBE_RETRY_INTERVAL;
                if failures >= PROBE_FAILURE_LIMIT {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_accept_matches_rfc_sample() {
        // RFC 6455 section 1.3 handshake example
        assert_eq!(
            websocket_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn tunnel_path_parses_host_and_port() {
        assert_eq!(
            parse_tunnel_path("/.well-known/reverse/tcp/127.0.0.1/9000/").as_deref(),
            Some("127.0.0.1:9000")
        );
        assert!(parse_tunnel_path("/.well-known/reverse/tcp/127.0.0.1/x/").is_none());
        assert!(parse_tunnel_path("/other").is_none());
    }

    #[test]
    fn upgrade_response_mirrors_protocol() {
        let buf = b"GET /.well-known/reverse/tcp/127.0.0.1/9000/ HTTP/1.1\r\n\
                    Host: edge.test\r\n\
                    Connection: Upgrade\r\n\
                    Upgrade: websocket\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let (_, req) = HttpRequest::parse_with_len(buf).unwrap().unwrap();
        let response = upgrade_response(&req);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("upgrade: websocket\r\n"));

        let buf = b"GET /.well-known/reverse/tcp/h/1/ HTTP/1.1\r\nHost: e\r\n\r\n";
        let (_, req) = HttpRequest::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(upgrade_response(&req), "HTTP/1.1 200 OK\r\n\r\n");
    }
}
