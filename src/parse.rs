use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Prebuffered;

/// Host and port authority parsed from request targets and dialer URLs.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Parses an authority-form request target (`host:port`).
    pub fn from_authority_str(s: &str) -> Result<Self> {
        let uri = Uri::from_str(s).std_context("invalid authority string")?;
        ensure_any!(uri.scheme().is_none(), "expected target without scheme");
        let authority = uri.authority().context("expected target with authority")?;
        let port = authority.port_u16().context("expected target with port")?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Parses an absolute-form URI, inferring the port from the scheme.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Formats an HTTP/1.1 CONNECT handshake for this target, with optional
    /// proxy Basic credentials.
    pub(crate) fn to_connect_request(
        &self,
        credentials: Option<(&str, &str)>,
        user_agent: &str,
    ) -> String {
        let mut req = format!(
            "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nUser-Agent: {1}\r\n",
            self, user_agent
        );
        if let Some((username, password)) = credentials {
            req.push_str("Proxy-Authorization: Basic ");
            req.push_str(&BASE64.encode(format!("{username}:{password}")));
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        req
    }
}

/// Encodes a `Basic` authorization header value.
pub(crate) fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

/// Decodes `Basic base64(user:pass)`; `None` on any other scheme or shape.
pub(crate) fn parse_basic_authorization(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Parsed HTTP request line and header section.
///
/// The request target is kept raw; [`HttpRequest::authority`] and
/// [`HttpRequest::absolute_uri`] classify it per RFC 9110 on demand.
#[derive(Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Raw request target (authority-form, absolute-form or origin-form).
    pub target: String,
    /// HTTP minor version from the request line (`0` or `1`).
    pub minor_version: u8,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpRequest {
    /// Target authority for CONNECT (authority-form) requests.
    pub fn authority(&self) -> Result<Authority> {
        Authority::from_authority_str(&self.target)
    }

    /// Parses the target as an absolute-form URI; `None` when origin-form.
    pub fn absolute_uri(&self) -> Option<Uri> {
        let uri = Uri::from_str(&self.target).ok()?;
        uri.scheme().is_some().then_some(uri)
    }

    /// The Host header, when present and valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Basic credentials from the named authorization header.
    pub(crate) fn basic_credentials(&self, header_name: &str) -> Option<(String, String)> {
        parse_basic_authorization(self.header(header_name)?)
    }

    /// Reads and parses the request line and header section, consuming it.
    ///
    /// Fails with [`io::ErrorKind::OutOfMemory`] if the header section does
    /// not fit the reader's buffer limit.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        loop {
            if let Some((len, request)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(request);
            }
            if reader.is_full() || reader.buffer_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "buffer limit reached before end of request header section",
                )
                .into());
            }
        }
    }

    /// Parses a request from a buffer; `None` when incomplete.
    ///
    /// Returns the header section length alongside the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method: Method = req
                    .method
                    .context("missing HTTP method")?
                    .parse()
                    .std_context("invalid HTTP method")?;
                let target = req.path.context("missing request target")?.to_string();
                let minor_version = req.version.context("missing HTTP version")?;
                let headers = header_map(req.headers);
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        minor_version,
                        headers,
                    },
                )))
            }
        }
    }

    /// Serializes the request line and headers as HTTP/1.1.
    pub(crate) async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let line = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        writer.write_all(line.as_bytes()).await?;
        write_headers(&self.headers, writer).await?;
        writer.write_all(b"\r\n").await
    }
}

/// Parsed HTTP response status line and header section.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    pub(crate) fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub(crate) fn with_reason(status: StatusCode, reason: impl ToString) -> Self {
        Self {
            status,
            reason: Some(reason.to_string()),
            headers: HeaderMap::new(),
        }
    }

    pub(crate) fn header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.append(name, value);
        }
        self
    }

    /// Returns the reason phrase or the canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Writes the status line, headers and terminating blank line.
    pub(crate) async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        writer.write_all(self.status_line().as_bytes()).await?;
        write_headers(&self.headers, writer).await?;
        writer.write_all(b"\r\n").await
    }

    /// Writes a complete minimal `text/plain` response with the status text
    /// as body.
    pub(crate) async fn write_with_body(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let content = format!("{} {}", self.status.as_u16(), self.reason());
        writer.write_all(self.status_line().as_bytes()).await?;
        write_headers(&self.headers, writer).await?;
        writer
            .write_all(
                format!(
                    "Content-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\n\r\n",
                    content.len()
                )
                .as_bytes(),
            )
            .await?;
        writer.write_all(content.as_bytes()).await
    }

    /// Parses a response from a buffer; `None` when incomplete.
    ///
    /// Returns the header section length alongside the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers: header_map(res.headers),
                    },
                )))
            }
        }
    }

    /// Reads and parses the status line and header section, consuming it.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        loop {
            if let Some((len, response)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(response);
            }
            if reader.is_full() || reader.buffer_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "buffer limit reached before end of response header section",
                )
                .into());
            }
        }
    }
}

fn header_map(headers: &mut [httparse::Header<'_>]) -> HeaderMap<HeaderValue> {
    HeaderMap::from_iter(headers.iter().flat_map(|h| {
        let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}

async fn write_headers(
    headers: &HeaderMap<HeaderValue>,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<()> {
    for (name, value) in headers.iter() {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_parses_as_authority_form() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (len, req) = HttpRequest::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(req.method, Method::CONNECT);
        let authority = req.authority().unwrap();
        assert_eq!(authority.host, "example.com");
        assert_eq!(authority.port, 443);
        assert!(req.absolute_uri().is_none());
    }

    #[test]
    fn absolute_form_default_ports() {
        let buf = b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (_, req) = HttpRequest::parse_with_len(buf).unwrap().unwrap();
        let uri = req.absolute_uri().unwrap();
        let authority = Authority::from_absolute_uri(&uri).unwrap();
        assert_eq!(authority.port, 80);
    }

    #[test]
    fn partial_request_is_incomplete() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: exa";
        assert!(HttpRequest::parse_with_len(buf).unwrap().is_none());
    }

    #[test]
    fn basic_round_trip() {
        let value = basic_authorization("alice", "s3cr3t");
        let (user, pass) = parse_basic_authorization(&value).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cr3t");
        assert!(parse_basic_authorization("Bearer abc").is_none());
    }

    #[test]
    fn connect_request_carries_credentials() {
        let authority = Authority {
            host: "edge.test".into(),
            port: 443,
        };
        let req = authority.to_connect_request(Some(("u", "p")), "test-agent");
        assert!(req.starts_with("CONNECT edge.test:443 HTTP/1.1\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_status_line() {
        let buf = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"x\"\r\n\r\nrest";
        let (len, res) = HttpResponse::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(res.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(&buf[len..], b"rest");
    }
}
