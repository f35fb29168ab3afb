use std::{io::Write as _, net::SocketAddr, sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    HEADER_SECTION_MAX_LENGTH, HttpResponse,
    config::{Config, ForwardConfig, HttpConfig, SocksConfig, TunnelConfig, TunnelServerConfig},
    dialer::DialerRegistry,
    http_forward::HttpForwardHandler,
    listener::{ConnHandler, DynConnHandler},
    request::RequestInfo,
    socks::SocksHandler,
    tunnel::{MemoryListeners, TunnelClient},
    util::{Prebuffered, forward_bidi},
};

// -- Test helpers --

fn empty_registry() -> Arc<DialerRegistry> {
    Arc::new(DialerRegistry::from_config(&Default::default(), Default::default()).unwrap())
}

/// Binds an ephemeral listener and serves every accepted connection with
/// the given handler, like the listener supervisor does.
async fn spawn_handler(
    handler: Arc<DynConnHandler<'static>>,
    proto: &'static str,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let info = RequestInfo::new(peer, addr, proto);
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = handler.serve(Box::new(stream), info).await;
            });
        }
    });
    (addr, task)
}

/// Spawns a TCP server that echoes every byte back.
async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    (addr, task)
}

fn write_users_csv(rows: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(rows.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn forward_http_config(policy: &str) -> HttpConfig {
    HttpConfig {
        forward: ForwardConfig {
            policy: policy.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn read_response_head(stream: &mut TcpStream) -> HttpResponse {
    let (read, _) = stream.split();
    let mut reader = Prebuffered::new(read, HEADER_SECTION_MAX_LENGTH);
    HttpResponse::read(&mut reader).await.unwrap()
}

/// Picks a port that was free a moment ago.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// -- HTTP forward proxy --

#[tokio::test]
async fn http_connect_tunnel_end_to_end() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await;
    let handler =
        HttpForwardHandler::new(&forward_http_config("proxy_pass"), empty_registry())?;
    let (proxy_addr, _proxy) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    let mut client = TcpStream::connect(proxy_addr).await.anyerr()?;
    client
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
        .await
        .anyerr()?;

    let response = read_response_head(&mut client).await;
    assert_eq!(response.status.as_u16(), 200);

    client.write_all(b"PING").await.anyerr()?;
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.anyerr()?;
    assert_eq!(&buf, b"PING");
    Ok(())
}

#[tokio::test]
async fn http_proxy_auth_challenge() -> Result {
    let handler =
        HttpForwardHandler::new(&forward_http_config("require_proxy_auth"), empty_registry())?;
    let (proxy_addr, _proxy) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    let mut client = TcpStream::connect(proxy_addr).await.anyerr()?;
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .anyerr()?;

    let response = read_response_head(&mut client).await;
    assert_eq!(response.status.as_u16(), 407);
    let challenge = response
        .headers
        .get("proxy-authenticate")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!(challenge, "Basic realm=\"Authentication Required\"");
    Ok(())
}

#[tokio::test]
async fn http_proxy_auth_round_trip() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await;
    let config = HttpConfig {
        forward: ForwardConfig {
            policy: "{{if request.proxy_authorization}}proxy_pass{{else}}require_proxy_auth{{end}}"
                .to_string(),
            auth: r#"echo '{"username":"u","speedlimit":0,"vip":1,"ttl":60}'"#.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let handler = HttpForwardHandler::new(&config, empty_registry())?;
    let (proxy_addr, _proxy) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    // without credentials: challenged
    let mut client = TcpStream::connect(proxy_addr).await.anyerr()?;
    client
        .write_all(
            format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes(),
        )
        .await
        .anyerr()?;
    let response = read_response_head(&mut client).await;
    assert_eq!(response.status.as_u16(), 407);
    drop(client);

    // with credentials: the auth command validates and the tunnel opens
    let mut client = TcpStream::connect(proxy_addr).await.anyerr()?;
    client
        .write_all(
            format!(
                "CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\
                 Proxy-Authorization: Basic dTpw\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .anyerr()?;
    let response = read_response_head(&mut client).await;
    assert_eq!(response.status.as_u16(), 200);

    client.write_all(b"PING").await.anyerr()?;
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.anyerr()?;
    assert_eq!(&buf, b"PING");
    Ok(())
}

#[tokio::test]
async fn http_connect_unreachable_origin_is_502() -> Result {
    let handler =
        HttpForwardHandler::new(&forward_http_config("proxy_pass"), empty_registry())?;
    let (proxy_addr, _proxy) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    // a port that nothing listens on
    let dead = free_port().await;
    let mut client = TcpStream::connect(proxy_addr).await.anyerr()?;
    client
        .write_all(
            format!("CONNECT 127.0.0.1:{dead} HTTP/1.1\r\nHost: 127.0.0.1:{dead}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .anyerr()?;

    let response = read_response_head(&mut client).await;
    assert_eq!(response.status.as_u16(), 502);
    Ok(())
}

#[tokio::test]
async fn http_reset_policy_closes_without_response() -> Result {
    let handler = HttpForwardHandler::new(&forward_http_config("reset"), empty_registry())?;
    let (proxy_addr, _proxy) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    let mut client = TcpStream::connect(proxy_addr).await.anyerr()?;
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .anyerr()?;

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.anyerr()?;
    assert!(buf.is_empty(), "reset must not produce a response");
    Ok(())
}

/// Serves one-line HTTP/1.1 responses with hyper, for request-relay tests.
async fn spawn_origin_server(body: &'static str) -> (SocketAddr, JoinHandle<()>) {
    use http_body_util::Full;
    use hyper::{Request, Response, body::Bytes, service::service_fn};
    use hyper_util::rt::TokioIo;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    (addr, task)
}

#[tokio::test]
async fn http_absolute_form_relay_through_proxy() -> Result {
    let (origin_addr, _origin) = spawn_origin_server("hello from origin").await;
    let handler =
        HttpForwardHandler::new(&forward_http_config("proxy_pass"), empty_registry())?;
    let (proxy_addr, _proxy) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()?;
    let response = client
        .get(format!("http://{origin_addr}/hello"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.anyerr()?, "hello from origin");
    Ok(())
}

// -- SOCKS5 --

async fn socks_handshake(
    addr: SocketAddr,
    username: &str,
    password: &str,
) -> Result<TcpStream> {
    let mut client = TcpStream::connect(addr).await.anyerr()?;
    client
        .write_all(&[0x05, 0x01, 0x02])
        .await
        .anyerr()?;
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.anyerr()?;
    assert_eq!(reply, [0x05, 0x02], "server must select password auth");

    let mut auth = vec![0x01, username.len() as u8];
    auth.extend_from_slice(username.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    client.write_all(&auth).await.anyerr()?;
    client.read_exact(&mut reply).await.anyerr()?;
    // compatibility quirk: success is signalled with the 0x05 framing
    assert_eq!(reply, [0x05, 0x00]);
    Ok(client)
}

fn socks_domain_request(host: &str, port: u16) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    req
}

#[tokio::test]
async fn socks_deny_domain_for_vip_user() -> Result {
    let users = write_users_csv(
        "username,password,speedlimit,vip\nalice,pw1,0,1\n",
    );
    let config = SocksConfig {
        forward: ForwardConfig {
            auth_table: users.path().display().to_string(),
            deny_domains: vec!["blocked.test".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let handler = SocksHandler::new(&config, empty_registry())?;
    let (addr, _task) = spawn_handler(DynConnHandler::new_arc(handler), "socks5").await;

    let mut client = socks_handshake(addr, "alice", "pw1").await?;
    client
        .write_all(&socks_domain_request("blocked.test", 80))
        .await
        .anyerr()?;

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.anyerr()?;
    assert_eq!(reply, [0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    Ok(())
}

#[tokio::test]
async fn socks_connect_end_to_end() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await;
    let users = write_users_csv("username,password,speedlimit,vip\nalice,pw1,0,1\n");
    let config = SocksConfig {
        forward: ForwardConfig {
            auth_table: users.path().display().to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let handler = SocksHandler::new(&config, empty_registry())?;
    let (addr, _task) = spawn_handler(DynConnHandler::new_arc(handler), "socks5").await;

    let mut client = socks_handshake(addr, "alice", "pw1").await?;
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    match echo_addr {
        SocketAddr::V4(v4) => {
            req.extend_from_slice(&v4.ip().octets());
            req.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(_) => unreachable!("listener is bound to 127.0.0.1"),
    }
    client.write_all(&req).await.anyerr()?;

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.anyerr()?;
    assert_eq!(reply[..2], [0x05, 0x00]);

    client.write_all(b"PING").await.anyerr()?;
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.anyerr()?;
    assert_eq!(&buf, b"PING");
    Ok(())
}

#[tokio::test]
async fn socks_wrong_password_is_rejected() -> Result {
    let users = write_users_csv("username,password,speedlimit,vip\nalice,pw1,0,1\n");
    let config = SocksConfig {
        forward: ForwardConfig {
            auth_table: users.path().display().to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let handler = SocksHandler::new(&config, empty_registry())?;
    let (addr, _task) = spawn_handler(DynConnHandler::new_arc(handler), "socks5").await;

    let mut client = TcpStream::connect(addr).await.anyerr()?;
    client.write_all(&[0x05, 0x01, 0x02]).await.anyerr()?;
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.anyerr()?;
    assert_eq!(reply, [0x05, 0x02]);

    client
        .write_all(&[0x01, 0x05, b'a', b'l', b'i', b'c', b'e', 0x03, b'b', b'a', b'd'])
        .await
        .anyerr()?;
    client.read_exact(&mut reply).await.anyerr()?;
    assert_eq!(reply, [0x05, 0x01]);
    Ok(())
}

// -- Relay primitives --

#[tokio::test]
async fn relay_close_propagates_to_peer() -> Result {
    let (client_near, client_far) = tokio::io::duplex(4096);
    let (origin_near, origin_far) = tokio::io::duplex(4096);

    let relay = tokio::spawn(async move {
        let (mut client_read, mut client_write) = tokio::io::split(client_far);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin_far);
        forward_bidi(
            &mut client_read,
            &mut client_write,
            &mut origin_read,
            &mut origin_write,
            0,
        )
        .await
    });

    let (mut client_read, mut client_write) = tokio::io::split(client_near);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin_near);

    client_write.write_all(b"hello").await.anyerr()?;
    let mut buf = [0u8; 5];
    origin_read.read_exact(&mut buf).await.anyerr()?;
    assert_eq!(&buf, b"hello");

    origin_write.write_all(b"world").await.anyerr()?;
    client_read.read_exact(&mut buf).await.anyerr()?;
    assert_eq!(&buf, b"world");

    // closing the client side must unwind the whole relay
    drop(client_write);
    drop(client_read);
    drop(origin_write);
    let result = tokio::time::timeout(Duration::from_secs(2), relay)
        .await
        .anyerr()?;
    assert!(result.is_ok());
    Ok(())
}

// -- Reverse tunnel --

#[tokio::test]
async fn reverse_tunnel_websocket_end_to_end() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await;

    // edge server: HTTP listener with the tunnel endpoint enabled
    let users = write_users_csv("username,password,allow_tunnel\nalice,pw1,1\n");
    let server_config = HttpConfig {
        tunnel: TunnelServerConfig {
            enabled: true,
            auth_table: users.path().display().to_string(),
            speed_limit: 0,
        },
        forward: ForwardConfig {
            policy: "proxy_pass".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let handler = HttpForwardHandler::new(&server_config, empty_registry())?;
    let (edge_addr, _edge) = spawn_handler(DynConnHandler::new_arc(handler), "http").await;

    // interior client: connects out to the edge and bridges to the echo server
    let reverse_port = free_port().await;
    let mut dialer_map = std::collections::HashMap::new();
    dialer_map.insert(
        "edge".to_string(),
        format!("ws://alice:pw1@{edge_addr}"),
    );
    let registry = Arc::new(DialerRegistry::from_config(&dialer_map, Default::default()).unwrap());
    let client = TunnelClient::new(
        TunnelConfig {
            listen: vec![format!("127.0.0.1:{reverse_port}")],
            proxy_pass: echo_addr.to_string(),
            dialer: "edge".to_string(),
            dial_timeout: 5,
            ..Default::default()
        },
        registry,
        Arc::new(MemoryListeners::new()),
    )?;
    let shutdown = CancellationToken::new();
    let tunnel_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(shutdown).await })
    };

    // the edge opens 127.0.0.1:{reverse_port} once the upgrade completes;
    // poll until a round trip through the tunnel works
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 4];
    loop {
        let attempt = async {
            let mut conn = TcpStream::connect(("127.0.0.1", reverse_port)).await?;
            conn.write_all(b"PING").await?;
            conn.read_exact(&mut buf).await?;
            std::io::Result::Ok(())
        };
        match tokio::time::timeout(Duration::from_millis(500), attempt).await {
            Ok(Ok(())) => break,
            _ if tokio::time::Instant::now() > deadline => {
                panic!("tunnel did not come up in time");
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    assert_eq!(&buf, b"PING");

    shutdown.cancel();
    tunnel_task.abort();
    Ok(())
}

// -- Configuration --

#[test]
fn config_overlay_preserves_declaration_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("base.yaml"),
        "https:\n  - listen: ['127.0.0.1:8441']\n",
    )
    .unwrap();
    std::fs::create_dir(dir.path().join("base.d")).unwrap();
    std::fs::write(
        dir.path().join("base.d").join("extra.yaml"),
        "https:\n  - listen: ['127.0.0.1:8442']\n",
    )
    .unwrap();

    let config = Config::load(dir.path().join("base.yaml")).unwrap();
    assert_eq!(config.https.len(), 2);
    assert_eq!(config.https[0].listen, ["127.0.0.1:8441"]);
    assert_eq!(config.https[1].listen, ["127.0.0.1:8442"]);
}
