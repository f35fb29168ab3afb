//! SOCKS5 CONNECT dialer (RFC 1928, with RFC 1929 username/password).

use std::net::IpAddr;

use n0_error::{anyerr, e};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{DialError, Dialer, DialerSpec, DirectDialer, ProxyStream};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub struct Socks5Dialer {
    host: String,
    port: u16,
    username: String,
    password: String,
    inner: DirectDialer,
}

impl Socks5Dialer {
    pub(crate) fn new(spec: DialerSpec, inner: DirectDialer) -> Self {
        Self {
            host: spec.host,
            port: spec.port,
            username: spec.username,
            password: spec.password,
            inner,
        }
    }

    fn proxy_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Dialer for Socks5Dialer {
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

        let proxy_addr = self.proxy_addr();
        let mut stream = self.inner.dial_tcp(&proxy_addr).await?;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();

        let io_err = |source: std::io::Error| {
            e!(DialError::Unreachable {
                addr: proxy_addr.clone(),
                source
            })
        };

        // method negotiation
        let with_auth = !self.username.is_empty();
        let greeting: &[u8] = if with_auth {
            &[VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[VERSION, 1, AUTH_NONE]
        };
        stream.write_all(greeting).await.map_err(io_err)?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.map_err(io_err)?;
        if reply[0] != VERSION {
            return Err(DialError::protocol(
                addr,
                anyerr!("unexpected SOCKS version {}", reply[0]),
            ));
        }
        match reply[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD if with_auth => {
                let mut sub = Vec::with_capacity(3 + self.username.len() + self.password.len());
                sub.push(0x01);
                sub.push(self.username.len() as u8);
                sub.extend_from_slice(self.username.as_bytes());
                sub.push(self.password.len() as u8);
                sub.extend_from_slice(self.password.as_bytes());
                stream.write_all(&sub).await.map_err(io_err)?;
                let mut auth_reply = [0u8; 2];
                stream.read_exact(&mut auth_reply).await.map_err(io_err)?;
                if auth_reply[1] != 0x00 {
                    return Err(e!(DialError::UpstreamRejected {
                        via: proxy_addr.clone(),
                        addr: addr.to_string(),
                        reason: "authentication failed".to_string(),
                    }));
                }
            }
            method => {
                return Err(DialError::protocol(
                    addr,
                    anyerr!("proxy selected unsupported auth method {method:#04x}"),
                ));
            }
        }

        // connect request
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            DialError::protocol(addr, anyerr!("target must be host:port"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| DialError::protocol(addr, anyerr!("invalid target port")))?;
        let host = host.trim_matches(|c| c == '[' || c == ']');

        let mut request = vec![VERSION, CMD_CONNECT, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(DialError::protocol(addr, anyerr!("hostname too long")));
                }
                request.push(ATYP_DOMAIN);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await.map_err(io_err)?;

        // reply: VER STATUS RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.map_err(io_err)?;
        if head[1] != 0x00 {
            return Err(e!(DialError::UpstreamRejected {
                via: proxy_addr.clone(),
                addr: addr.to_string(),
                reason: format!("SOCKS status {:#04x}", head[1]),
            }));
        }
        let bind_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.map_err(io_err)?;
                len[0] as usize
            }
            atyp => {
                return Err(DialError::protocol(
                    addr,
                    anyerr!("invalid bind address type {atyp:#04x}"),
                ));
            }
        };
        let mut bind = vec![0u8; bind_len + 2];
        stream.read_exact(&mut bind).await.map_err(io_err)?;

        Ok(ProxyStream::new(stream).with_addrs(local, remote))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;

    fn dialer(proxy: SocketAddr, username: &str) -> Socks5Dialer {
        Socks5Dialer::new(
            DialerSpec {
                scheme: "socks5".into(),
                host: proxy.ip().to_string(),
                port: proxy.port(),
                username: username.into(),
                password: "pw".into(),
                query: Default::default(),
            },
            DirectDialer::default(),
        )
    }

    /// Minimal in-process SOCKS5 server covering the no-auth happy path.
    async fn serve_one(listener: TcpListener, grant: bool) {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n >= 3 && buf[0] == VERSION);
        conn.write_all(&[VERSION, AUTH_NONE]).await.unwrap();

        let mut head = [0u8; 4];
        conn.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], CMD_CONNECT);
        let skip = match head[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            _ => {
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await.unwrap();
                len[0] as usize + 2
            }
        };
        let mut rest = vec![0u8; skip];
        conn.read_exact(&mut rest).await.unwrap();

        let status = if grant { 0x00 } else { 0x05 };
        conn.write_all(&[VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        if grant {
            // echo a byte to prove the tunnel is live
            let mut byte = [0u8; 1];
            conn.read_exact(&mut byte).await.unwrap();
            conn.write_all(&byte).await.unwrap();
        }
    }

    #[tokio::test]
    async fn connect_granted_relays_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_one(listener, true));

        let mut stream = dialer(proxy, "").open("tcp", "example.test:80").await.unwrap();
        stream.write_all(b"x").await.unwrap();
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"x");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_maps_to_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_one(listener, false));

        let err = dialer(proxy, "").open("tcp", "example.test:80").await.unwrap_err();
        assert!(err.to_string().contains("rejected"), "{err}");
        server.await.unwrap();
    }
}
