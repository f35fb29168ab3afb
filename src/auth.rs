//! Authentication data: auth-command results, the CSV user table and
//! domain allow/deny sets.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use n0_error::{Result, StdResultExt, anyerr};
use serde::Deserialize;
use tracing::{debug, warn};

/// Result of a successful authentication.
///
/// Decoded from the auth command's JSON output; also synthesized from CSV
/// user records on the SOCKS path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub username: String,
    /// Relay throughput cap in bytes per second; `0` means unlimited.
    #[serde(default, rename = "speedlimit")]
    pub speed_limit: u64,
    /// Authorization tier; `0` is untrusted/anonymous.
    #[serde(default)]
    pub vip: i64,
    /// Cache lifetime in seconds; `0` disables caching.
    #[serde(default)]
    pub ttl: u64,
    /// Non-empty error text denies the request.
    #[serde(default)]
    pub error: String,
}

/// One row of the user table.
#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
    /// Remaining CSV columns, keyed by header name.
    pub attrs: HashMap<String, String>,
}

impl UserRecord {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// CSV-backed user table, sorted by username for binary search.
///
/// Reloaded in the background when the file's mtime changes.
pub struct UserTable {
    loader: FileLoader<Vec<UserRecord>>,
}

impl UserTable {
    /// Loads `path` and starts the reload poller.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let loader = FileLoader::start(path.into(), Duration::from_secs(60), parse_user_csv)?;
        Ok(Self { loader })
    }

    /// Looks up `username` and checks `password`, producing the record.
    pub fn verify(&self, username: &str, password: &str) -> Result<UserRecord> {
        let records = self.loader.get();
        let i = records
            .binary_search_by(|r| r.username.as_str().cmp(username))
            .map_err(|_| anyerr!("invalid username: {username}"))?;
        let record = &records[i];
        if record.password != password {
            return Err(anyerr!("wrong password for user: {username}"));
        }
        Ok(record.clone())
    }
}

fn parse_user_csv(data: &[u8]) -> Result<Vec<UserRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(data);
    let headers = reader.headers().anyerr()?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.anyerr()?;
        let mut record = UserRecord::default();
        for (name, value) in headers.iter().zip(row.iter()) {
            match name {
                "username" => record.username = value.to_string(),
                "password" => record.password = value.to_string(),
                _ => {
                    record.attrs.insert(name.to_string(), value.to_string());
                }
            }
        }
        if !record.username.is_empty() {
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.username.cmp(&b.username));
    Ok(records)
}

/// File-backed snapshot with lock-free reads.
///
/// A background task stats the file on an interval and re-parses it when
/// the mtime changes; readers swap in the new snapshot without locking.
pub struct FileLoader<T> {
    snapshot: Arc<ArcSwap<T>>,
}

impl<T: Send + Sync + 'static> FileLoader<T> {
    pub fn start(
        path: PathBuf,
        poll: Duration,
        parse: fn(&[u8]) -> Result<T>,
    ) -> Result<Self> {
        let data = std::fs::read(&path)
            .std_context(format!("failed to read {}", path.display()))?;
        let value = parse(&data)?;
        let snapshot = Arc::new(ArcSwap::from_pointee(value));

        let weak = Arc::downgrade(&snapshot);
        tokio::spawn(async move {
            let mut mtime = file_mtime(&path);
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(snapshot) = weak.upgrade() else {
                    break;
                };
                let current = file_mtime(&path);
                if current == mtime {
                    continue;
                }
                mtime = current;
                match std::fs::read(&path).map_err(Into::into).and_then(|d| parse(&d)) {
                    Ok(value) => {
                        debug!(path = %path.display(), "reloaded file snapshot");
                        snapshot.store(Arc::new(value));
                    }
                    Err(err) => {
                        warn!(path = %path.display(), "failed to reload file: {err:#}");
                    }
                }
            }
        });

        Ok(Self { snapshot })
    }

    /// Current snapshot; lock-free.
    pub fn get(&self) -> Arc<T> {
        self.snapshot.load_full()
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Exact-match domain set with `@file` expansion.
///
/// Entries are matched against the effective-TLD-plus-one of request
/// hosts. An entry of the form `@path` contributes one domain per line of
/// the named file.
#[derive(Debug, Default, Clone)]
pub struct DomainSet(HashSet<String>);

impl DomainSet {
    pub fn from_patterns(patterns: &[String]) -> Self {
        let mut set = HashSet::new();
        for pattern in patterns {
            if let Some(path) = pattern.strip_prefix('@') {
                match std::fs::read_to_string(path) {
                    Ok(data) => {
                        set.extend(
                            data.lines()
                                .map(str::trim)
                                .filter(|l| !l.is_empty())
                                .map(str::to_string),
                        );
                    }
                    Err(err) => {
                        warn!(file = path, "failed to read domain file: {err}");
                    }
                }
            } else if !pattern.is_empty() {
                set.insert(pattern.clone());
            }
        }
        Self(set)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains(domain)
    }
}

/// The registrable domain (effective TLD plus one) of `host`, or the host
/// itself for IP literals and unlisted suffixes.
pub fn effective_domain(host: &str) -> &str {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    psl::domain_str(host).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    const CSV: &str = "username,password,speedlimit,vip,allow_tunnel\n\
                       carol,pw3,0,0,0\n\
                       alice,pw1,1024,1,1\n\
                       bob,pw2,0,2,0\n";

    #[test]
    fn csv_is_sorted_and_attrs_kept() {
        let records = parse_user_csv(CSV.as_bytes()).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.username.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert_eq!(records[0].attr("allow_tunnel"), Some("1"));
        assert_eq!(records[0].attr("speedlimit"), Some("1024"));
    }

    #[tokio::test]
    async fn table_verifies_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CSV.as_bytes()).unwrap();
        let table = UserTable::open(file.path()).unwrap();

        let user = table.verify("alice", "pw1").unwrap();
        assert_eq!(user.attr("vip"), Some("1"));
        assert!(table.verify("alice", "wrong").is_err());
        assert!(table.verify("mallory", "pw1").is_err());
    }

    #[test]
    fn effective_domain_handles_ips_and_subdomains() {
        assert_eq!(effective_domain("a.b.example.com"), "example.com");
        assert_eq!(effective_domain("example.co.uk"), "example.co.uk");
        assert_eq!(effective_domain("192.0.2.1"), "192.0.2.1");
    }

    #[test]
    fn domain_set_expands_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"blocked.test\n\nother.test\n").unwrap();
        let set = DomainSet::from_patterns(&[
            format!("@{}", file.path().display()),
            "direct.test".to_string(),
        ]);
        assert!(set.contains("blocked.test"));
        assert!(set.contains("other.test"));
        assert!(set.contains("direct.test"));
        assert!(!set.contains("free.test"));
    }
}
