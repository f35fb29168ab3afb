//! HTTP forward-proxy handler.
//!
//! Terminates HTTP/1.1 and HTTP/2 on a listener, runs the policy, auth and
//! upstream-selection pipeline, then either tunnels (CONNECT) or relays the
//! request to the origin. Web serving (static files, index pages) is an
//! external collaborator reached through [`NextHandler`].

use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use dynosaur::dynosaur;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use n0_error::{Result, StdResultExt, anyerr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH, REVERSE_TUNNEL_PREFIX,
    auth::{AuthInfo, DomainSet, effective_domain},
    config::HttpConfig,
    dialer::{BoxStream, DialerRegistry},
    listener::ConnHandler,
    parse::{Authority, HttpRequest, HttpResponse},
    policy::{
        AllowIpCache, AuthCommand, AuthScheme, PolicyDecision, Template, TemplateVars,
    },
    request::RequestInfo,
    tunnel_server::TunnelServerHandler,
    util::{Prebuffered, RateLimitedReader, forward_bidi},
};

/// Upper bound on a buffered request body for origin relays.
const MAX_BODY_BUFFER: usize = 16 * 1024 * 1024;

#[dynosaur(pub DynNextHandler = dyn(box) NextHandler)]
/// Fallback for requests the proxy pipeline does not claim: local server
/// names, listeners without a policy, and template failures. The real
/// deployment hangs file/index serving here.
pub trait NextHandler: Send + Sync {
    fn respond<'a>(
        &'a self,
        req: &'a HttpRequest,
        writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> impl Future<Output = std::io::Result<()>> + Send + 'a;
}

/// Default next handler: a plain 404.
struct NotFoundHandler;

impl NextHandler for NotFoundHandler {
    async fn respond<'a>(
        &'a self,
        _req: &'a HttpRequest,
        mut writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        HttpResponse::new(StatusCode::NOT_FOUND)
            .write_with_body(&mut writer)
            .await
    }
}

/// Outcome of the policy/auth/upstream pipeline for one request.
enum Verdict {
    /// Hand the request to the next handler.
    Next,
    /// Delayed 400.
    Reject,
    /// Drop the connection without a response.
    Reset,
    /// Demand credentials.
    Challenge(AuthScheme),
    /// Continue to dial/relay through the named dialer ("" = direct).
    Forward { upstream: String, auth: AuthInfo },
}

#[derive(Clone)]
pub struct HttpForwardHandler {
    inner: Arc<Inner>,
}

struct Inner {
    server_names: HashSet<String>,
    policy: Option<Template>,
    auth: Option<AuthCommand>,
    upstream: Option<Template>,
    allow_domains: DomainSet,
    deny_domains: DomainSet,
    speed_limit: u64,
    dialers: Arc<DialerRegistry>,
    allow_ip: AllowIpCache,
    tunnel: Option<Arc<TunnelServerHandler>>,
    next: Arc<DynNextHandler<'static>>,
    http_client: reqwest::Client,
}

impl HttpForwardHandler {
    pub fn new(config: &HttpConfig, dialers: Arc<DialerRegistry>) -> Result<Self> {
        Self::with_next(config, dialers, NotFoundHandler)
    }

    pub fn with_next(
        config: &HttpConfig,
        dialers: Arc<DialerRegistry>,
        next: impl NextHandler + 'static,
    ) -> Result<Self> {
        let tunnel = config
            .tunnel
            .enabled
            .then(|| TunnelServerHandler::new(&config.tunnel).map(Arc::new))
            .transpose()?;
        Ok(Self {
            inner: Arc::new(Inner {
                server_names: config.server_name.iter().cloned().collect(),
                policy: Template::parse_optional(&config.forward.policy)?,
                auth: Template::parse_optional(&config.forward.auth)?.map(AuthCommand::new),
                upstream: Template::parse_optional(&config.forward.upstream)?,
                allow_domains: DomainSet::from_patterns(&config.forward.allow_domains),
                deny_domains: DomainSet::from_patterns(&config.forward.deny_domains),
                speed_limit: config.forward.speed_limit,
                dialers,
                allow_ip: AllowIpCache::new(),
                tunnel,
                next: DynNextHandler::new_arc(next),
                http_client: reqwest::Client::builder()
                    .use_rustls_tls()
                    .no_proxy()
                    .build()
                    .anyerr()?,
            }),
        })
    }
}

impl ConnHandler for HttpForwardHandler {
    async fn serve<'a>(&'a self, stream: BoxStream, info: RequestInfo) -> Result<()> {
        let negotiated_h2 = info
            .tls
            .as_ref()
            .and_then(|t| t.alpn.as_deref())
            .is_some_and(|alpn| alpn == "h2");
        if negotiated_h2 {
            return self.inner.clone().serve_h2(stream, info).await;
        }
        self.inner.serve_http1(stream, info).await
    }
}

impl Inner {
    // -- HTTP/1.x path --

    async fn serve_http1(&self, stream: BoxStream, info: RequestInfo) -> Result<()> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = Prebuffered::new(read_half, HEADER_SECTION_MAX_LENGTH);
        let req = HttpRequest::read(&mut reader).await?;

        if let Some(tunnel) = &self.tunnel {
            if req.target.starts_with(REVERSE_TUNNEL_PREFIX) {
                return tunnel.serve_upgrade(req, reader, writer, &info).await;
            }
        }

        let host = request_host(&req);
        match self.evaluate(&req, &info, &host).await {
            Verdict::Next => {
                self.next.respond(&req, &mut writer).await.anyerr()?;
                Ok(())
            }
            Verdict::Reject => {
                reject_delay().await;
                HttpResponse::with_reason(StatusCode::BAD_REQUEST, "Bad Request")
                    .write_with_body(&mut writer)
                    .await
                    .anyerr()?;
                Ok(())
            }
            Verdict::Reset => {
                // drop both halves without writing a response
                Ok(())
            }
            Verdict::Challenge(scheme) => {
                write_challenge(&mut writer, scheme).await.anyerr()?;
                Ok(())
            }
            Verdict::Forward { upstream, auth } => {
                info!(
                    remote_ip = %info.remote_ip(),
                    method = %req.method,
                    host = %host,
                    username = %auth.username,
                    upstream = %upstream,
                    "forward request"
                );
                if req.method == Method::CONNECT {
                    self.connect_http1(&req, reader, writer, &upstream, &auth)
                        .await
                } else {
                    self.relay_http1(req, reader, writer, &upstream, &auth).await
                }
            }
        }
    }

    async fn connect_http1(
        &self,
        req: &HttpRequest,
        mut reader: Prebuffered<impl AsyncRead + Send + Unpin>,
        mut writer: impl AsyncWrite + Send + Unpin,
        upstream: &str,
        auth: &AuthInfo,
    ) -> Result<()> {
        let Ok(authority) = req.authority() else {
            HttpResponse::with_reason(StatusCode::BAD_REQUEST, "Bad Request")
                .write_with_body(&mut writer)
                .await
                .anyerr()?;
            return Ok(());
        };

        let origin = match self
            .dialers
            .open_via(upstream, "tcp", &authority.to_addr())
            .await
        {
            Ok(origin) => origin,
            Err(err) => {
                warn!(host = %authority, "dial failed: {err:#}");
                HttpResponse::with_reason(StatusCode::BAD_GATEWAY, "Bad Gateway")
                    .write_with_body(&mut writer)
                    .await
                    .anyerr()?;
                return Ok(());
            }
        };

        debug!(origin = ?origin.remote_addr, local = ?origin.local_addr, "connect tunnel open");
        writer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.anyerr()?;
        let (mut origin_read, mut origin_write) = tokio::io::split(origin);
        let (up, down) = forward_bidi(
            &mut reader,
            &mut writer,
            &mut origin_read,
            &mut origin_write,
            auth.speed_limit,
        )
        .await?;
        debug!(up, down, "connect tunnel finished");
        Ok(())
    }

    async fn relay_http1(
        &self,
        req: HttpRequest,
        mut reader: Prebuffered<impl AsyncRead + Send + Unpin>,
        mut writer: impl AsyncWrite + Send + Unpin,
        upstream: &str,
        auth: &AuthInfo,
    ) -> Result<()> {
        let Some(host) = req.host().map(str::to_string) else {
            HttpResponse::new(StatusCode::NOT_FOUND)
                .write_with_body(&mut writer)
                .await
                .anyerr()?;
            return Ok(());
        };

        // absolute-form keeps its URL, origin-form defaults to http://host
        let url = match req.absolute_uri() {
            Some(uri) => uri.to_string(),
            None => format!("http://{}{}", host, req.target),
        };

        let body = match read_request_body(&req, &mut reader).await {
            Ok(body) => body,
            Err(err) => {
                debug!("failed to read request body: {err:#}");
                HttpResponse::with_reason(StatusCode::BAD_REQUEST, "Bad Request")
                    .write_with_body(&mut writer)
                    .await
                    .anyerr()?;
                return Ok(());
            }
        };

        let mut headers = req.headers.clone();
        filter_hop_by_hop_headers(&mut headers);

        let response = match self
            .origin_round_trip(req.method.clone(), &url, headers, body, upstream)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, "origin round trip failed: {err:#}");
                HttpResponse::with_reason(StatusCode::BAD_GATEWAY, "Bad Gateway")
                    .write_with_body(&mut writer)
                    .await
                    .anyerr()?;
                return Ok(());
            }
        };

        let (status, resp_headers, body) = response;
        let mut head = HttpResponse::new(status);
        head.headers = resp_headers;
        head.headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        head.headers.remove("keep-alive");
        head.write(&mut writer).await.anyerr()?;

        let mut limited = RateLimitedReader::new(body, auth.speed_limit);
        let transmitted = tokio::io::copy(&mut limited, &mut writer).await.anyerr()?;
        writer.shutdown().await.ok();
        debug!(transmitted, "request relay finished");
        Ok(())
    }

    /// Round-trips a non-CONNECT request: directly through the shared HTTP
    /// client, or hand-written HTTP/1.1 over the named dialer's stream.
    async fn origin_round_trip(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap<HeaderValue>,
        body: Bytes,
        upstream: &str,
    ) -> Result<(StatusCode, HeaderMap<HeaderValue>, BoxStream)> {
        if upstream.is_empty() {
            let response = self
                .http_client
                .request(method, url)
                .headers(headers)
                .body(body)
                .send()
                .await
                .anyerr()?;
            let status = response.status();
            let mut resp_headers = response.headers().clone();
            // the client decodes chunked framing, so its headers must not
            // advertise it downstream
            filter_hop_by_hop_headers(&mut resp_headers);

            let (local, mut pipe) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let mut response = response;
                while let Ok(Some(chunk)) = response.chunk().await {
                    if pipe.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = pipe.shutdown().await;
            });
            return Ok((status, resp_headers, Box::new(local)));
        }

        let uri: Uri = url.parse().std_context("invalid origin url")?;
        let authority = Authority::from_absolute_uri(&uri)?;
        let origin = self
            .dialers
            .open_via(upstream, "tcp", &authority.to_addr())
            .await
            .map_err(|err| anyerr!(err))?;

        let origin: BoxStream = if uri.scheme_str() == Some("https") {
            let connector =
                TlsConnector::from(crate::dialer::tls::client_config(&[b"http/1.1"], false));
            let name = crate::dialer::tls::server_name(&authority.host)?;
            Box::new(connector.connect(name, origin).await.anyerr()?)
        } else {
            Box::new(origin)
        };

        let mut outbound = HttpRequest {
            method,
            target: uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| "/".to_string()),
            minor_version: 1,
            headers,
        };
        outbound
            .headers
            .insert(http::header::HOST, HeaderValue::from_str(&authority.to_addr()).anyerr()?);
        outbound
            .headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        if !body.is_empty() {
            outbound.headers.insert(
                http::header::CONTENT_LENGTH,
                HeaderValue::from_str(&body.len().to_string()).anyerr()?,
            );
        }

        let (read_half, mut write_half) = tokio::io::split(origin);
        outbound.write(&mut write_half).await.anyerr()?;
        if !body.is_empty() {
            write_half.write_all(&body).await.anyerr()?;
        }

        let mut reader = Prebuffered::new(read_half, HEADER_SECTION_MAX_LENGTH);
        let response = HttpResponse::read(&mut reader).await?;
        Ok((response.status, response.headers, Box::new(reader)))
    }

    // -- HTTP/2 path --

    async fn serve_h2(self: Arc<Self>, stream: BoxStream, info: RequestInfo) -> Result<()> {
        let mut connection = h2::server::handshake(stream).await.anyerr()?;
        while let Some(result) = connection.accept().await {
            let (request, respond) = result.anyerr()?;
            let inner = self.clone();
            let info = info.clone();
            tokio::spawn(async move {
                if let Err(err) = inner.handle_h2_request(request, respond, info).await {
                    debug!("h2 request failed: {err:#}");
                }
            });
        }
        Ok(())
    }

    async fn handle_h2_request(
        &self,
        request: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
        info: RequestInfo,
    ) -> Result<()> {
        let (parts, recv_body) = request.into_parts();

        // downgraded view of the h2 request for the shared pipeline
        let mut req = HttpRequest {
            method: parts.method.clone(),
            target: if parts.method == Method::CONNECT {
                parts
                    .uri
                    .authority()
                    .map(|a| a.as_str().to_string())
                    .unwrap_or_default()
            } else {
                parts.uri.to_string()
            },
            minor_version: 1,
            headers: parts.headers.clone(),
        };
        // h2 carries the host in :authority, not a Host header
        if !req.headers.contains_key(http::header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    req.headers.insert(http::header::HOST, value);
                }
            }
        }
        let host = request_host(&req);

        match self.evaluate(&req, &info, &host).await {
            Verdict::Next => {
                send_h2_empty(&mut respond, StatusCode::NOT_FOUND)?;
                Ok(())
            }
            Verdict::Reject => {
                reject_delay().await;
                send_h2_empty(&mut respond, StatusCode::BAD_REQUEST)?;
                Ok(())
            }
            Verdict::Reset => {
                respond.send_reset(h2::Reason::CANCEL);
                Ok(())
            }
            Verdict::Challenge(scheme) => {
                let (status, header) = challenge_parts(scheme);
                let response = http::Response::builder()
                    .status(status)
                    .header(header, "Basic realm=\"Authentication Required\"")
                    .body(())
                    .anyerr()?;
                respond.send_response(response, true).anyerr()?;
                Ok(())
            }
            Verdict::Forward { upstream, auth } => {
                if parts.method == Method::CONNECT {
                    self.connect_h2(&req, recv_body, respond, &upstream, &auth).await
                } else {
                    self.relay_h2(req, recv_body, respond, &upstream, &auth).await
                }
            }
        }
    }

    async fn connect_h2(
        &self,
        req: &HttpRequest,
        recv_body: h2::RecvStream,
        mut respond: h2::server::SendResponse<Bytes>,
        upstream: &str,
        auth: &AuthInfo,
    ) -> Result<()> {
        let Ok(authority) = req.authority() else {
            send_h2_empty(&mut respond, StatusCode::BAD_REQUEST)?;
            return Ok(());
        };
        let origin = match self
            .dialers
            .open_via(upstream, "tcp", &authority.to_addr())
            .await
        {
            Ok(origin) => origin,
            Err(err) => {
                warn!(host = %authority, "dial failed: {err:#}");
                send_h2_empty(&mut respond, StatusCode::BAD_GATEWAY)?;
                return Ok(());
            }
        };

        let response = http::Response::builder().status(StatusCode::OK).body(()).anyerr()?;
        let send_body = respond.send_response(response, false).anyerr()?;

        let client = crate::dialer::http2::Http2Stream::new(send_body, recv_body);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin);
        let (up, down) = forward_bidi(
            &mut client_read,
            &mut client_write,
            &mut origin_read,
            &mut origin_write,
            auth.speed_limit,
        )
        .await?;
        debug!(up, down, "h2 connect tunnel finished");
        Ok(())
    }

    async fn relay_h2(
        &self,
        req: HttpRequest,
        mut recv_body: h2::RecvStream,
        mut respond: h2::server::SendResponse<Bytes>,
        upstream: &str,
        auth: &AuthInfo,
    ) -> Result<()> {
        let Some(host) = req.host().map(str::to_string) else {
            send_h2_empty(&mut respond, StatusCode::NOT_FOUND)?;
            return Ok(());
        };
        let url = match req.absolute_uri() {
            Some(uri) if uri.scheme().is_some() => uri.to_string(),
            _ => format!("http://{}{}", host, req.target),
        };

        let mut body = BytesMut::new();
        while let Some(chunk) = recv_body.data().await {
            let chunk = chunk.anyerr()?;
            let _ = recv_body.flow_control().release_capacity(chunk.len());
            body.extend_from_slice(&chunk);
            if body.len() > MAX_BODY_BUFFER {
                send_h2_empty(&mut respond, StatusCode::PAYLOAD_TOO_LARGE)?;
                return Ok(());
            }
        }

        let mut headers = req.headers.clone();
        filter_hop_by_hop_headers(&mut headers);

        let (status, mut resp_headers, resp_body) = match self
            .origin_round_trip(req.method.clone(), &url, headers, body.freeze(), upstream)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, "origin round trip failed: {err:#}");
                send_h2_empty(&mut respond, StatusCode::BAD_GATEWAY)?;
                return Ok(());
            }
        };

        // connection-level headers must not cross an h2 boundary
        filter_hop_by_hop_headers(&mut resp_headers);
        let mut builder = http::Response::builder().status(status);
        for (name, value) in resp_headers.iter() {
            builder = builder.header(name, value);
        }
        let response = builder.body(()).anyerr()?;
        let send_body = respond.send_response(response, false).anyerr()?;

        // reuse the CONNECT stream adapter for capacity-aware body writes
        let mut sink = crate::dialer::http2::Http2Stream::for_response(send_body);
        let mut limited = RateLimitedReader::new(resp_body, auth.speed_limit);
        let transmitted = tokio::io::copy(&mut limited, &mut sink).await.anyerr()?;
        sink.shutdown().await.ok();
        debug!(transmitted, "h2 request relay finished");
        Ok(())
    }

    // -- shared pipeline --

    /// Runs the decision pipeline: server-name fallthrough, policy
    /// template, allow-IP cache, auth command, domain filters and upstream
    /// selection, in that order.
    async fn evaluate(&self, req: &HttpRequest, info: &RequestInfo, host: &str) -> Verdict {
        if self.server_names.contains(host) && req.method != Method::CONNECT {
            debug!(host, "request for local server name");
            return Verdict::Next;
        }

        let Some(policy) = &self.policy else {
            return Verdict::Next;
        };

        let domain = effective_domain(host).to_string();
        let vars = self.template_vars(req, info, host, &domain, None);

        let mut bypass_auth = false;
        match policy.render(&vars) {
            Err(err) => {
                warn!("policy template failed: {err:#}");
                return Verdict::Next;
            }
            Ok(output) => {
                let decision = PolicyDecision::parse(&output);
                debug!(output = %output.trim(), ?decision, "policy evaluated");
                match decision {
                    PolicyDecision::ProxyPass => {}
                    PolicyDecision::Reject => return Verdict::Reject,
                    PolicyDecision::Reset => return Verdict::Reset,
                    PolicyDecision::RequireAuth(scheme) => return Verdict::Challenge(scheme),
                    PolicyDecision::BypassAuth => bypass_auth = true,
                    PolicyDecision::AllowIp => {
                        bypass_auth = true;
                        self.allow_ip.allow(info.remote_ip());
                        info!(remote_ip = %info.remote_ip(), "allow_ip granted");
                    }
                }
            }
        }

        if !bypass_auth && self.allow_ip.check(info.remote_ip()) {
            bypass_auth = true;
        }

        let mut auth = AuthInfo::default();
        if !bypass_auth {
            if let Some(command) = &self.auth {
                match command.authenticate(&vars).await {
                    Ok(result) => auth = result,
                    Err(err) => {
                        warn!(remote_ip = %info.remote_ip(), "auth failed: {err:#}");
                        return Verdict::Reject;
                    }
                }
            }
        }

        if auth.vip > 0 {
            if !self.allow_domains.is_empty() || !self.deny_domains.is_empty() {
                if !self.allow_domains.is_empty() && !self.allow_domains.contains(&domain) {
                    return Verdict::Reject;
                }
                if self.deny_domains.contains(&domain) {
                    return Verdict::Reject;
                }
            }
            if auth.speed_limit == 0 && self.speed_limit > 0 {
                auth.speed_limit = self.speed_limit;
            }
        }

        let mut upstream = String::new();
        if let Some(template) = &self.upstream {
            let vars = self.template_vars(req, info, host, &domain, Some(&auth));
            match template.render(&vars) {
                Err(err) => {
                    warn!("upstream template failed: {err:#}");
                    return Verdict::Next;
                }
                Ok(output) => upstream = output.trim().to_string(),
            }
        }

        Verdict::Forward { upstream, auth }
    }

    fn template_vars(
        &self,
        req: &HttpRequest,
        info: &RequestInfo,
        host: &str,
        domain: &str,
        auth: Option<&AuthInfo>,
    ) -> TemplateVars {
        let mut vars = TemplateVars::new()
            .set("request.method", &req.method)
            .set("request.host", host)
            .set("request.target", &req.target)
            .set("request.domain", domain)
            .set("request.proto", info.proto)
            .set("request.remote_ip", info.remote_ip())
            .set("request.user_agent", req.header("user-agent").unwrap_or(""))
            .set(
                "request.proxy_authorization",
                req.header("proxy-authorization").unwrap_or(""),
            )
            .set(
                "request.authorization",
                req.header("authorization").unwrap_or(""),
            )
            .set("tls.sni", info.server_name().unwrap_or(""))
            .set(
                "tls.version",
                info.tls
                    .as_ref()
                    .and_then(|t| t.version.as_deref())
                    .unwrap_or(""),
            );
        if let Some(auth) = auth {
            vars = vars
                .set("user.username", &auth.username)
                .set("user.vip", auth.vip)
                .set("user.speed_limit", auth.speed_limit);
        }
        vars
    }
}

/// Request host with the port stripped: the Host header for ordinary
/// requests, the authority for CONNECT.
fn request_host(req: &HttpRequest) -> String {
    let raw = if req.method == Method::CONNECT {
        req.target.as_str()
    } else {
        req.host().unwrap_or("")
    };
    strip_port(raw).to_string()
}

fn strip_port(hostport: &str) -> &str {
    if let Some(rest) = hostport.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => hostport,
    }
}

/// Reads a Content-Length body into memory, capped at [`MAX_BODY_BUFFER`].
///
/// Chunked request bodies are refused; the relay rewrites requests and
/// needs a known length.
async fn read_request_body(
    req: &HttpRequest,
    reader: &mut Prebuffered<impl AsyncRead + Send + Unpin>,
) -> Result<Bytes> {
    if req.header("transfer-encoding").is_some() {
        return Err(anyerr!("chunked request bodies are not supported"));
    }
    let length: usize = match req.header("content-length") {
        None | Some("0") => return Ok(Bytes::new()),
        Some(value) => value.parse().std_context("invalid content-length")?,
    };
    if length > MAX_BODY_BUFFER {
        return Err(anyerr!("request body of {length} bytes exceeds buffer"));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.anyerr()?;
    Ok(body.into())
}

/// Strips connection-level headers per RFC 9110 before a hop boundary.
fn filter_hop_by_hop_headers(headers: &mut HeaderMap<HeaderValue>) {
    for name in [
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

fn challenge_parts(scheme: AuthScheme) -> (StatusCode, &'static str) {
    match scheme {
        AuthScheme::Proxy => (
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "proxy-authenticate",
        ),
        AuthScheme::Www => (StatusCode::UNAUTHORIZED, "www-authenticate"),
    }
}

async fn write_challenge(
    writer: &mut (impl AsyncWrite + Send + Unpin),
    scheme: AuthScheme,
) -> std::io::Result<()> {
    let (status, header) = challenge_parts(scheme);
    HttpResponse::with_reason(status, "Authentication Required")
        .header(header, "Basic realm=\"Authentication Required\"")
        .write_with_body(writer)
        .await
}

/// Rejections are delayed by a uniform 1-3 s to slow probe loops.
async fn reject_delay() {
    let delay = Duration::from_millis(rand::random_range(1000..3000));
    tokio::time::sleep(delay).await;
}

fn send_h2_empty(
    respond: &mut h2::server::SendResponse<Bytes>,
    status: StatusCode,
) -> Result<()> {
    let response = http::Response::builder().status(status).body(()).anyerr()?;
    respond.send_response(response, true).anyerr()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("127.0.0.1:8080"), "127.0.0.1");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("host", HeaderValue::from_static("example.com"));
        filter_hop_by_hop_headers(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("host").is_some());
    }
}
