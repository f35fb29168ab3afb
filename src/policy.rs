//! Policy and authentication engine.
//!
//! Listener policy is a text template rendered against the request
//! descriptor; its trimmed output is matched against a fixed set of
//! decision keywords. Authentication runs an external command rendered
//! from a second template, parses its JSON output into [`AuthInfo`] and
//! caches positive results by the exact command line.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use dashmap::DashMap;
use n0_error::{AnyError, Result, anyerr, bail, e, stack_error};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::AuthInfo;

/// How long an `allow_ip` decision whitelists the remote address.
const ALLOW_IP_TTL: Duration = Duration::from_secs(6 * 3600);

/// Wall-clock budget for one auth command run.
const AUTH_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum PolicyError {
    #[error("unterminated variable in template at byte {offset}")]
    UnterminatedVariable { offset: usize },
    #[error("unknown template variable {name}")]
    UnknownVariable { name: String },
    #[error("unbalanced if/else/end in template")]
    UnbalancedConditional,
    #[error("auth command failed")]
    AuthCommand {
        #[error(source)]
        source: AnyError,
    },
    #[error("auth command timed out")]
    AuthTimeout,
}

/// Decision produced by evaluating the policy template.
///
/// Unknown keywords fall through to [`PolicyDecision::ProxyPass`]; template
/// output is trimmed before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Continue the proxy pipeline.
    ProxyPass,
    /// Answer with a delayed 400 (HTTP) or close silently (SOCKS).
    Reject,
    /// Tear the underlying connection down without a response.
    Reset,
    /// Demand credentials with the given challenge scheme.
    RequireAuth(AuthScheme),
    /// Skip authentication for this request.
    BypassAuth,
    /// Skip authentication and whitelist the remote IP for six hours.
    AllowIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `407` with `Proxy-Authenticate`.
    Proxy,
    /// `401` with `WWW-Authenticate`.
    Www,
}

impl PolicyDecision {
    pub fn parse(output: &str) -> Self {
        match output.trim() {
            "reject" | "deny" => Self::Reject,
            "reset" | "close" => Self::Reset,
            "require_auth" | "require_proxy_auth" | "require_socks_auth" => {
                Self::RequireAuth(AuthScheme::Proxy)
            }
            "require_www_auth" => Self::RequireAuth(AuthScheme::Www),
            "bypass_auth" => Self::BypassAuth,
            "allow_ip" => Self::AllowIp,
            _ => Self::ProxyPass,
        }
    }
}

/// A parsed substitution template: `{{ variable }}` interpolation plus
/// `{{if variable}} … {{else}} … {{end}}` branching on non-empty values.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Variable(String),
    If {
        variable: String,
        then: Vec<Segment>,
        otherwise: Vec<Segment>,
    },
}

#[derive(Debug)]
enum Token {
    Literal(String),
    Tag(String),
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, PolicyError> {
        let mut tokens = tokenize(src)?.into_iter();
        let (segments, closing) = parse_segments(&mut tokens, false)?;
        if closing.is_some() {
            bail!(PolicyError::UnbalancedConditional);
        }
        Ok(Self { segments })
    }

    /// Parses a template from config, treating an empty string as absent.
    pub fn parse_optional(src: &str) -> Result<Option<Self>, PolicyError> {
        if src.trim().is_empty() {
            return Ok(None);
        }
        Self::parse(src).map(Some)
    }

    pub fn render(&self, vars: &TemplateVars) -> Result<String, PolicyError> {
        let mut out = String::new();
        render_segments(&self.segments, vars, &mut out)?;
        Ok(out)
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, PolicyError> {
    let mut tokens = Vec::new();
    let mut rest = src;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            bail!(PolicyError::UnterminatedVariable {
                offset: offset + start
            });
        };
        tokens.push(Token::Tag(after[..end].trim().to_string()));
        offset += start + 2 + end + 2;
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    Ok(tokens)
}

/// Consumes tokens until end-of-input or, inside a conditional, an `else`
/// or `end` tag, which is handed back to the caller.
fn parse_segments(
    tokens: &mut impl Iterator<Item = Token>,
    in_conditional: bool,
) -> Result<(Vec<Segment>, Option<String>), PolicyError> {
    let mut segments = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Literal(text) => segments.push(Segment::Literal(text)),
            Token::Tag(tag) => {
                if let Some(variable) = tag.strip_prefix("if ") {
                    let variable = variable.trim().to_string();
                    let (then, closing) = parse_segments(tokens, true)?;
                    let otherwise = match closing.as_deref() {
                        Some("else") => {
                            let (otherwise, closing) = parse_segments(tokens, true)?;
                            if closing.as_deref() != Some("end") {
                                bail!(PolicyError::UnbalancedConditional);
                            }
                            otherwise
                        }
                        Some("end") => Vec::new(),
                        _ => bail!(PolicyError::UnbalancedConditional),
                    };
                    segments.push(Segment::If {
                        variable,
                        then,
                        otherwise,
                    });
                } else if tag == "else" || tag == "end" {
                    if !in_conditional {
                        bail!(PolicyError::UnbalancedConditional);
                    }
                    return Ok((segments, Some(tag)));
                } else {
                    segments.push(Segment::Variable(tag));
                }
            }
        }
    }
    Ok((segments, None))
}

fn render_segments(
    segments: &[Segment],
    vars: &TemplateVars,
    out: &mut String,
) -> Result<(), PolicyError> {
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Variable(name) => match vars.get(name) {
                Some(value) => out.push_str(value),
                None => bail!(PolicyError::UnknownVariable { name: name.clone() }),
            },
            Segment::If {
                variable,
                then,
                otherwise,
            } => {
                let truthy = vars.get(variable).is_some_and(|v| !v.is_empty());
                render_segments(if truthy { then } else { otherwise }, vars, out)?;
            }
        }
    }
    Ok(())
}

/// Variable bindings for template rendering.
///
/// Handlers bind the request descriptor under `request.*`, ClientHello
/// fields under `tls.*` and, after authentication, the user under `user.*`.
#[derive(Debug, Default, Clone)]
pub struct TemplateVars(HashMap<String, String>);

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// External auth command: template, runner and TTL cache.
pub struct AuthCommand {
    template: Template,
    cache: DashMap<String, CachedAuth>,
}

struct CachedAuth {
    info: AuthInfo,
    deadline: Instant,
}

impl AuthCommand {
    pub fn new(template: Template) -> Self {
        Self {
            template,
            cache: DashMap::new(),
        }
    }

    /// Renders the command line, consults the cache, and otherwise executes
    /// the command and parses its JSON output.
    ///
    /// Positive TTLs cache the result keyed by the exact command line;
    /// expired entries are deleted when hit.
    pub async fn authenticate(&self, vars: &TemplateVars) -> Result<AuthInfo, PolicyError> {
        let command_line = self.template.render(vars)?.trim().to_string();

        if let Some(info) = self.cache_lookup(&command_line) {
            return Ok(info);
        }

        let info = run_auth_command(&command_line).await?;
        if info.ttl > 0 {
            self.cache.insert(
                command_line,
                CachedAuth {
                    info: info.clone(),
                    deadline: Instant::now() + Duration::from_secs(info.ttl),
                },
            );
        }
        Ok(info)
    }

    /// Cache hit with a live deadline, or `None`. An expired hit deletes
    /// the entry before reporting the miss.
    fn cache_lookup(&self, command_line: &str) -> Option<AuthInfo> {
        {
            let entry = self.cache.get(command_line)?;
            if entry.deadline > Instant::now() {
                return Some(entry.info.clone());
            }
        }
        self.cache.remove(command_line);
        None
    }

    #[cfg(test)]
    pub(crate) fn insert_cached(&self, command_line: &str, info: AuthInfo, ttl: Duration) {
        self.cache.insert(
            command_line.to_string(),
            CachedAuth {
                info,
                deadline: Instant::now() + ttl,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, command_line: &str) -> bool {
        self.cache.contains_key(command_line)
    }
}

async fn run_auth_command(command_line: &str) -> Result<AuthInfo, PolicyError> {
    let argv = shell_words::split(command_line)
        .map_err(|err| e!(PolicyError::AuthCommand, anyerr!(err)))?;
    let Some((program, args)) = argv.split_first() else {
        return Err(e!(PolicyError::AuthCommand, anyerr!("empty auth command")));
    };

    let output = tokio::time::timeout(
        AUTH_COMMAND_TIMEOUT,
        tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| e!(PolicyError::AuthTimeout))?
    .map_err(|err| e!(PolicyError::AuthCommand, anyerr!(err)))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    if !output.status.success() {
        warn!(command = %command_line, output = %String::from_utf8_lossy(&combined), "auth command exited nonzero");
        return Err(e!(
            PolicyError::AuthCommand,
            anyerr!("auth command exited with {}", output.status)
        ));
    }
    debug!(command = %command_line, "auth command ok");

    let info: AuthInfo = serde_json::from_slice(&combined)
        .map_err(|err| e!(PolicyError::AuthCommand, anyerr!(err)))?;
    if !info.error.is_empty() {
        return Err(e!(PolicyError::AuthCommand, anyerr!("{}", info.error)));
    }
    Ok(info)
}

/// Remote addresses whitelisted by an `allow_ip` decision.
///
/// Keyed by IP with an absolute deadline; expiry is checked on read, not
/// proactively.
#[derive(Default)]
pub struct AllowIpCache(DashMap<IpAddr, Instant>);

impl AllowIpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, ip: IpAddr) {
        self.0.insert(ip, Instant::now() + ALLOW_IP_TTL);
    }

    /// True when `ip` is still whitelisted. Expired entries are removed.
    pub fn check(&self, ip: IpAddr) -> bool {
        {
            let Some(deadline) = self.0.get(&ip) else {
                return false;
            };
            if *deadline > Instant::now() {
                return true;
            }
        }
        self.0.remove(&ip);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_matches_trimmed_output() {
        for (raw, expected) in [
            ("proxy_pass", PolicyDecision::ProxyPass),
            ("  proxy_pass\n", PolicyDecision::ProxyPass),
            ("\treject ", PolicyDecision::Reject),
            ("deny", PolicyDecision::Reject),
            ("reset\n\n", PolicyDecision::Reset),
            ("close", PolicyDecision::Reset),
            (
                " require_proxy_auth ",
                PolicyDecision::RequireAuth(AuthScheme::Proxy),
            ),
            (
                "require_www_auth",
                PolicyDecision::RequireAuth(AuthScheme::Www),
            ),
            ("bypass_auth", PolicyDecision::BypassAuth),
            ("  allow_ip", PolicyDecision::AllowIp),
            ("", PolicyDecision::ProxyPass),
            ("anything_else", PolicyDecision::ProxyPass),
        ] {
            assert_eq!(PolicyDecision::parse(raw), expected, "input {raw:?}");
        }
    }

    #[test]
    fn template_substitutes_variables() {
        let template = Template::parse("check {{request.host}}:{{ request.port }}").unwrap();
        let vars = TemplateVars::new()
            .set("request.host", "example.com")
            .set("request.port", 443);
        assert_eq!(template.render(&vars).unwrap(), "check example.com:443");
    }

    #[test]
    fn template_unknown_variable_errors() {
        let template = Template::parse("{{nope}}").unwrap();
        assert!(template.render(&TemplateVars::new()).is_err());
        assert!(Template::parse("{{unclosed").is_err());
        assert!(Template::parse_optional("  ").unwrap().is_none());
    }

    #[test]
    fn template_conditionals_branch_on_non_empty() {
        let template = Template::parse(
            "{{if request.proxy_authorization}}proxy_pass{{else}}require_proxy_auth{{end}}",
        )
        .unwrap();

        let with = TemplateVars::new().set("request.proxy_authorization", "Basic dTpw");
        assert_eq!(template.render(&with).unwrap(), "proxy_pass");

        let without = TemplateVars::new().set("request.proxy_authorization", "");
        assert_eq!(template.render(&without).unwrap(), "require_proxy_auth");
    }

    #[test]
    fn template_nested_conditionals() {
        let template = Template::parse(
            "{{if a}}{{if b}}both{{else}}only-a{{end}}{{else}}none{{end}}",
        )
        .unwrap();
        let vars = TemplateVars::new().set("a", "1").set("b", "");
        assert_eq!(template.render(&vars).unwrap(), "only-a");
        assert!(Template::parse("{{if a}}x").is_err());
        assert!(Template::parse("{{end}}").is_err());
    }

    #[tokio::test]
    async fn auth_command_parses_json_and_caches() {
        let template = Template::parse(
            r#"echo '{"username":"u","speedlimit":1024,"vip":1,"ttl":60}'"#,
        )
        .unwrap();
        let auth = AuthCommand::new(template);
        let info = auth.authenticate(&TemplateVars::new()).await.unwrap();
        assert_eq!(info.username, "u");
        assert_eq!(info.speed_limit, 1024);
        assert_eq!(info.vip, 1);
        assert!(auth.cached(r#"echo '{"username":"u","speedlimit":1024,"vip":1,"ttl":60}'"#));
    }

    #[tokio::test]
    async fn auth_command_error_field_denies() {
        let template =
            Template::parse(r#"echo '{"username":"u","error":"bad password"}'"#).unwrap();
        let auth = AuthCommand::new(template);
        assert!(auth.authenticate(&TemplateVars::new()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_cache_respects_ttl() {
        let auth = AuthCommand::new(Template::parse("auth-cmd alice").unwrap());
        let info = AuthInfo {
            username: "alice".into(),
            ..Default::default()
        };
        auth.insert_cached("auth-cmd alice", info, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        let hit = auth.cache_lookup("auth-cmd alice").unwrap();
        assert_eq!(hit.username, "alice");

        tokio::time::advance(Duration::from_secs(2)).await;
        // an expired hit reports a miss and deletes the entry
        assert!(auth.cache_lookup("auth-cmd alice").is_none());
        assert!(!auth.cached("auth-cmd alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn allow_ip_expires_on_read() {
        let cache = AllowIpCache::new();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        cache.allow(ip);
        assert!(cache.check(ip));
        tokio::time::advance(ALLOW_IP_TTL + Duration::from_secs(1)).await;
        assert!(!cache.check(ip));
        assert!(!cache.check(ip));
    }
}
