//! SOCKS5 server handler (RFC 1928 with RFC 1929 username/password auth).

use std::{net::IpAddr, sync::Arc};

use n0_error::{Result, anyerr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthInfo, DomainSet, UserTable, effective_domain},
    config::SocksConfig,
    dialer::{BoxStream, DialerRegistry},
    listener::ConnHandler,
    policy::{PolicyDecision, Template, TemplateVars},
    request::RequestInfo,
    util::forward_bidi,
};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;

const STATUS_GRANTED: u8 = 0x00;
const STATUS_GENERAL_FAILURE: u8 = 0x01;
const STATUS_NOT_ALLOWED: u8 = 0x02;
const STATUS_NETWORK_UNREACHABLE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub struct SocksHandler {
    policy: Option<Template>,
    users: Option<UserTable>,
    upstream: Option<Template>,
    allow_domains: DomainSet,
    deny_domains: DomainSet,
    speed_limit: u64,
    dialers: Arc<DialerRegistry>,
}

impl SocksHandler {
    pub fn new(config: &SocksConfig, dialers: Arc<DialerRegistry>) -> Result<Self> {
        let users = if config.forward.auth_table.is_empty() {
            None
        } else {
            Some(UserTable::open(config.forward.auth_table.as_str())?)
        };
        Ok(Self {
            policy: Template::parse_optional(&config.forward.policy)?,
            users,
            upstream: Template::parse_optional(&config.forward.upstream)?,
            allow_domains: DomainSet::from_patterns(&config.forward.allow_domains),
            deny_domains: DomainSet::from_patterns(&config.forward.deny_domains),
            speed_limit: config.forward.speed_limit,
            dialers,
        })
    }

    fn vars(&self, info: &RequestInfo, username: &str, host: &str, port: u16) -> TemplateVars {
        TemplateVars::new()
            .set("request.proto", "socks5")
            .set("request.remote_ip", info.remote_ip())
            .set("request.username", username)
            .set("request.host", host)
            .set("request.port", port)
            .set(
                "request.domain",
                if host.is_empty() {
                    String::new()
                } else {
                    effective_domain(host).to_string()
                },
            )
    }

    fn decide(&self, vars: &TemplateVars) -> Result<PolicyDecision> {
        let Some(policy) = &self.policy else {
            return Ok(PolicyDecision::ProxyPass);
        };
        let output = policy.render(vars).map_err(|err| anyerr!(err))?;
        let decision = PolicyDecision::parse(&output);
        debug!(output = %output.trim(), ?decision, "socks policy evaluated");
        Ok(decision)
    }
}

impl ConnHandler for SocksHandler {
    async fn serve<'a>(&'a self, stream: BoxStream, info: RequestInfo) -> Result<()> {
        let mut conn = stream;

        // greeting: VER NMETHODS METHODS...
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(anyerr!("unsupported socks version {}", head[0]));
        }
        let mut methods = vec![0u8; head[1] as usize];
        conn.read_exact(&mut methods).await?;
        let supports_auth = methods.contains(&AUTH_PASSWORD);

        // first policy pass, before any address is known
        let mut bypass_auth = false;
        match self.decide(&self.vars(&info, "", "", 0))? {
            PolicyDecision::Reject | PolicyDecision::Reset => return Ok(()),
            PolicyDecision::BypassAuth | PolicyDecision::AllowIp => bypass_auth = true,
            PolicyDecision::RequireAuth(_) | PolicyDecision::ProxyPass => {}
        }

        let mut auth = AuthInfo::default();
        if !bypass_auth {
            if !supports_auth {
                debug!(remote_ip = %info.remote_ip(), "client lacks username/password auth");
                return Ok(());
            }
            conn.write_all(&[VERSION, AUTH_PASSWORD]).await?;

            // sub-negotiation: VER ULEN UNAME PLEN PASSWD
            let mut sub_head = [0u8; 2];
            conn.read_exact(&mut sub_head).await?;
            let mut username = vec![0u8; sub_head[1] as usize];
            conn.read_exact(&mut username).await?;
            let mut plen = [0u8; 1];
            conn.read_exact(&mut plen).await?;
            let mut password = vec![0u8; plen[0] as usize];
            conn.read_exact(&mut password).await?;
            let username = String::from_utf8_lossy(&username).into_owned();
            let password = String::from_utf8_lossy(&password).into_owned();

            if let Some(users) = &self.users {
                match users.verify(&username, &password) {
                    Ok(record) => {
                        auth.username = record.username.clone();
                        auth.vip = record
                            .attr("vip")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or_default();
                        auth.speed_limit = record
                            .attr("speedlimit")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or_default();
                    }
                    Err(err) => {
                        warn!(remote_ip = %info.remote_ip(), username, "socks auth failed: {err:#}");
                        conn.write_all(&[VERSION, STATUS_GENERAL_FAILURE]).await.ok();
                        return Ok(());
                    }
                }
            } else {
                auth.username = username;
            }
        }

        // deviates from RFC 1929 (which wants 0x01 0x00); kept for client
        // compatibility with deployed peers that expect the 0x05 framing
        conn.write_all(&[VERSION, AUTH_NONE]).await?;

        // request: VER CMD RSV ATYP ADDR... PORT
        let mut req_head = [0u8; 4];
        conn.read_exact(&mut req_head).await?;
        let host = match req_head[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                conn.read_exact(&mut octets).await?;
                IpAddr::from(octets).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                conn.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                conn.read_exact(&mut octets).await?;
                IpAddr::from(octets).to_string()
            }
            atyp => {
                write_status(&mut conn, STATUS_GENERAL_FAILURE).await.ok();
                return Err(anyerr!("invalid socks address type {atyp}"));
            }
        };
        let mut port_buf = [0u8; 2];
        conn.read_exact(&mut port_buf).await?;
        let port = u16::from_be_bytes(port_buf);
        let is_domain = req_head[3] == ATYP_DOMAIN;

        // second policy pass with the enriched request
        let vars = self.vars(&info, &auth.username, &host, port);
        match self.decide(&vars)? {
            PolicyDecision::Reject | PolicyDecision::RequireAuth(_) => {
                write_status(&mut conn, STATUS_NOT_ALLOWED).await.ok();
                return Ok(());
            }
            PolicyDecision::Reset => return Ok(()),
            _ => {}
        }

        if auth.vip > 0 {
            if is_domain && (!self.allow_domains.is_empty() || !self.deny_domains.is_empty()) {
                let domain = effective_domain(&host);
                if (!self.allow_domains.is_empty() && !self.allow_domains.contains(domain))
                    || self.deny_domains.contains(domain)
                {
                    write_status(&mut conn, STATUS_NOT_ALLOWED).await.ok();
                    return Ok(());
                }
            }
            if auth.speed_limit == 0 && self.speed_limit > 0 {
                auth.speed_limit = self.speed_limit;
            }
        }

        let mut upstream = String::new();
        if let Some(template) = &self.upstream {
            match template.render(&vars) {
                Ok(output) => upstream = output.trim().to_string(),
                Err(err) => {
                    warn!("upstream template failed: {err:#}");
                    write_status(&mut conn, STATUS_GENERAL_FAILURE).await.ok();
                    return Ok(());
                }
            }
        }

        info!(
            remote_ip = %info.remote_ip(),
            username = %auth.username,
            host = %host,
            port,
            upstream = %upstream,
            trace_id = %info.trace_id,
            "forward socks request"
        );

        let addr = format!("{host}:{port}");
        let origin = match self.dialers.open_via(&upstream, "tcp", &addr).await {
            Ok(origin) => origin,
            Err(err) => {
                warn!(addr = %addr, "socks dial failed: {err:#}");
                write_status(&mut conn, STATUS_NETWORK_UNREACHABLE).await.ok();
                return Ok(());
            }
        };

        write_status(&mut conn, STATUS_GRANTED).await?;

        let (mut client_read, mut client_write) = tokio::io::split(conn);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin);
        let (up, down) = forward_bidi(
            &mut client_read,
            &mut client_write,
            &mut origin_read,
            &mut origin_write,
            auth.speed_limit,
        )
        .await?;
        debug!(up, down, "socks relay finished");
        Ok(())
    }
}

/// Reply with a zeroed IPv4 bind address, as the relay does not expose one.
async fn write_status(
    conn: &mut (impl AsyncWriteExt + Unpin),
    status: u8,
) -> std::io::Result<()> {
    conn.write_all(&[VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
