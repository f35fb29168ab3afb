//! Configuration model and loading.
//!
//! A single YAML or JSON file, optionally merged with every same-extension
//! file from the sibling `<stem>.d/` directory: list sections concatenate
//! in declaration order (primary file first), the dialer map unions. Values
//! prefixed with `@` are replaced by the named file's contents. The legacy
//! `upstream:` key is renamed to `dialer:` on the raw bytes before parsing.

use std::{collections::HashMap, fs, path::Path};

use n0_error::{AnyError, Result, anyerr, bail, e, stack_error};
use serde::Deserialize;

/// Errors that make a configuration unusable at load time.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[error(source, std_err)]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[error(source)]
        source: AnyError,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    /// Named outbound dialers: name to URL spec.
    pub dialer: HashMap<String, String>,
    pub http: Vec<HttpConfig>,
    pub https: Vec<HttpConfig>,
    pub socks: Vec<SocksConfig>,
    pub tunnel: Vec<TunnelConfig>,
    pub stream: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub log_level: String,
    /// Outbound dial timeout in seconds; `0` means no explicit timeout.
    pub dial_timeout: u64,
    /// Resolver used for tunnel host lookups, `ip[:port]`.
    pub dns_server: String,
    pub tcp_keepalive: u64,
    pub dial_read_buffer: usize,
    pub dial_write_buffer: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: Vec<String>,
    pub server_name: Vec<String>,
    pub keyfile: String,
    pub certfile: String,
    pub forward: ForwardConfig,
    pub tunnel: TunnelServerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Policy template; empty disables the proxy pipeline on this listener.
    pub policy: String,
    /// Auth command template; empty disables command auth.
    pub auth: String,
    /// Upstream dialer-name template; empty means direct.
    pub upstream: String,
    /// CSV user table for credential lookups (SOCKS listeners).
    pub auth_table: String,
    pub allow_domains: Vec<String>,
    pub deny_domains: Vec<String>,
    pub speed_limit: u64,
    pub log: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelServerConfig {
    pub enabled: bool,
    /// CSV user table gating tunnel creation.
    pub auth_table: String,
    pub speed_limit: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SocksConfig {
    pub listen: Vec<String>,
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub listen: Vec<String>,
    pub keyfile: String,
    pub certfile: String,
    /// Relay target: `host:port`, `scheme://host:port` or `unix:///path`.
    pub proxy_pass: String,
    pub dialer: String,
    pub dial_timeout: u64,
    pub speed_limit: u64,
    pub log: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Address to bind on the remote edge; exactly one entry.
    pub listen: Vec<String>,
    /// Local target accepted tunnel streams are bridged to.
    pub proxy_pass: String,
    /// Name of the dialer whose URL selects the tunnel transport.
    pub dialer: String,
    pub dns_server: String,
    pub dial_timeout: u64,
    pub speed_limit: u64,
    pub log: bool,
}

impl Config {
    /// Loads and merges configuration from `path` and its `.d/` overlay.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let primary = fs::read(path).map_err(|source| {
            e!(ConfigError::Read {
                path: path.display().to_string(),
                source
            })
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        let mut merged = parse_one(&ext, &path.display().to_string(), &primary)?;

        let overlay_dir = path.with_extension("d");
        if let Ok(entries) = fs::read_dir(&overlay_dir) {
            let mut names: Vec<_> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext.as_str()))
                .collect();
            names.sort();
            for overlay in names {
                let data = fs::read(&overlay).map_err(|source| {
                    e!(ConfigError::Read {
                        path: overlay.display().to_string(),
                        source
                    })
                })?;
                let parsed = parse_one(&ext, &overlay.display().to_string(), &data)?;
                merged.merge(parsed);
            }
        }

        merged.expand_file_refs()?;
        merged.validate()?;
        Ok(merged)
    }

    /// Extends list sections and unions the dialer map; `global` always
    /// comes from the primary file.
    fn merge(&mut self, other: Config) {
        self.dialer.extend(other.dialer);
        self.http.extend(other.http);
        self.https.extend(other.https);
        self.socks.extend(other.socks);
        self.tunnel.extend(other.tunnel);
        self.stream.extend(other.stream);
    }

    fn expand_file_refs(&mut self) -> Result<(), ConfigError> {
        for section in self.http.iter_mut().chain(self.https.iter_mut()) {
            expand(&mut section.forward.policy)?;
            expand(&mut section.forward.auth)?;
            expand(&mut section.forward.upstream)?;
        }
        for section in self.socks.iter_mut() {
            expand(&mut section.forward.policy)?;
            expand(&mut section.forward.upstream)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for tunnel in &self.tunnel {
            if tunnel.listen.len() != 1 || tunnel.listen[0].is_empty() {
                bail!(ConfigError::Invalid {
                    reason: format!("tunnel requires exactly one listen address, got {:?}", tunnel.listen),
                });
            }
            if tunnel.dialer.is_empty() {
                bail!(ConfigError::Invalid {
                    reason: "tunnel requires a dialer".to_string(),
                });
            }
            if !self.dialer.contains_key(&tunnel.dialer) {
                bail!(ConfigError::Invalid {
                    reason: format!("tunnel dialer {:?} is not defined", tunnel.dialer),
                });
            }
        }
        for stream in &self.stream {
            if stream.proxy_pass.is_empty() {
                bail!(ConfigError::Invalid {
                    reason: "stream requires proxy_pass".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn parse_one(ext: &str, name: &str, data: &[u8]) -> Result<Config, ConfigError> {
    let data = rename_legacy_upstream(data);
    let parsed = match ext {
        "json" => serde_json::from_slice(&data).map_err(|err| {
            e!(ConfigError::Parse {
                path: name.to_string(),
                source: anyerr!(err)
            })
        })?,
        _ => serde_yaml::from_slice(&data).map_err(|err| {
            e!(ConfigError::Parse {
                path: name.to_string(),
                source: anyerr!(err)
            })
        })?,
    };
    Ok(parsed)
}

/// Replaces a leading-`@` value with the contents of the named file.
fn expand(value: &mut String) -> Result<(), ConfigError> {
    if let Some(path) = value.strip_prefix('@') {
        let data = fs::read_to_string(path).map_err(|source| {
            e!(ConfigError::Read {
                path: path.to_string(),
                source
            })
        })?;
        *value = data;
    }
    Ok(())
}

/// Renames the legacy top-level `upstream:` key to `dialer:`, preserving
/// indentation, before the bytes reach the parser.
fn rename_legacy_upstream(data: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(data) else {
        return data.to_vec();
    };
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let indent_len = line.len() - line.trim_start_matches(' ').len();
        let rest = &line[indent_len..];
        if let Some(tail) = rest.strip_prefix("upstream:") {
            out.push_str(&line[..indent_len]);
            out.push_str("dialer:");
            out.push_str(tail);
        } else {
            out.push_str(line);
        }
    }
    out.into_bytes()
}

/// Resolves the config path from the CLI argument or the `ENV` environment
/// variable (`$ENV.json` / `$ENV.yaml`, defaulting to `development`).
pub fn resolve_config_path(arg: Option<String>) -> Result<String> {
    if let Some(path) = arg {
        return Ok(path);
    }
    let env = std::env::var("ENV").unwrap_or_else(|_| "development".to_string());
    for ext in ["json", "yaml"] {
        let candidate = format!("{env}.{ext}");
        if Path::new(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(anyerr!(
        "no config file argument and neither {env}.json nor {env}.yaml exists"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, data: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn overlay_lists_concatenate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "base.yaml",
            "https:\n  - listen: ['127.0.0.1:8441']\n",
        );
        fs::create_dir(dir.path().join("base.d")).unwrap();
        write(
            &dir.path().join("base.d"),
            "extra.yaml",
            "https:\n  - listen: ['127.0.0.1:8442']\n",
        );

        let config = Config::load(&base).unwrap();
        assert_eq!(config.https.len(), 2);
        assert_eq!(config.https[0].listen, vec!["127.0.0.1:8441"]);
        assert_eq!(config.https[1].listen, vec!["127.0.0.1:8442"]);
    }

    #[test]
    fn legacy_upstream_key_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "cfg.yaml",
            "upstream:\n  edge: 'https://u:p@edge.test:443'\n",
        );
        let config = Config::load(&base).unwrap();
        assert_eq!(
            config.dialer.get("edge").map(String::as_str),
            Some("https://u:p@edge.test:443")
        );
    }

    #[test]
    fn at_values_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = write(dir.path(), "policy.tmpl", "proxy_pass");
        let base = write(
            dir.path(),
            "cfg.yaml",
            &format!(
                "http:\n  - listen: ['127.0.0.1:8080']\n    forward:\n      policy: '@{}'\n",
                policy.display()
            ),
        );
        let config = Config::load(&base).unwrap();
        assert_eq!(config.http[0].forward.policy, "proxy_pass");
    }

    #[test]
    fn tunnel_listen_must_be_single_and_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "cfg.yaml",
            "dialer:\n  up: 'wss://u:p@edge.test/'\ntunnel:\n  - listen: ['']\n    dialer: up\n",
        );
        assert!(Config::load(&base).is_err());

        let ok = write(
            dir.path(),
            "ok.yaml",
            "dialer:\n  up: 'wss://u:p@edge.test/'\ntunnel:\n  - listen: ['127.0.0.1:9000']\n    dialer: up\n    proxy_pass: '127.0.0.1:22'\n",
        );
        assert!(Config::load(&ok).is_ok());
    }
}
