//! Service and backend configuration documents, plus the stats views
//! returned by the admin API.
//!
//! Configuration is pushed by the orchestration layer as JSON. Defaults
//! are normalized before comparison so that a document with explicit
//! default values compares equal to one that omits them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default health check interval in milliseconds.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 2000;

/// Default number of consecutive successful checks before a backend is Up.
pub const DEFAULT_RISE: u32 = 2;

/// Default number of consecutive failed checks before a backend is Down.
pub const DEFAULT_FALL: u32 = 2;

/// Default backend dial timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Balancing strategy for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Balance {
    /// Weighted round robin.
    #[default]
    RoundRobin,
    /// Least active connections.
    LeastConn,
}

impl Balance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Balance::RoundRobin => "RR",
            Balance::LeastConn => "LC",
        }
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Balance {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "" | "RR" => Ok(Balance::RoundRobin),
            "LC" => Ok(Balance::LeastConn),
            other => Err(format!("unsupported balance mode: {other}")),
        }
    }
}

impl Serialize for Balance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Balance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One upstream target of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    /// Address dialed by health checks. Empty disables health checking.
    #[serde(default)]
    pub check_address: String,
    #[serde(default)]
    pub weight: u32,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            check_address: String::new(),
            weight: 1,
        }
    }

    /// Copy with a zero weight raised to 1.
    pub fn normalized(&self) -> Self {
        Self {
            weight: self.weight.max(1),
            ..self.clone()
        }
    }

    /// Field-for-field equality after normalization.
    pub fn equal(&self, other: &BackendConfig) -> bool {
        self.normalized() == other.normalized()
    }
}

/// A named listener, its backends and its balancing policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub virtual_hosts: Vec<String>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub balance: Balance,
    /// Milliseconds between health checks.
    #[serde(default)]
    pub check_interval: u64,
    #[serde(default)]
    pub fall: u32,
    #[serde(default)]
    pub rise: u32,
    /// Client side read/write deadline in milliseconds, 0 disables.
    #[serde(default)]
    pub client_timeout: u64,
    /// Backend side read/write deadline in milliseconds, 0 disables.
    #[serde(default)]
    pub server_timeout: u64,
    /// Backend dial timeout in milliseconds, 0 uses the default.
    #[serde(default)]
    pub connect_timeout: u64,
    /// HTTP status code to error page URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_pages: BTreeMap<u16, String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    /// Copy with defaults filled in, hostnames normalized and sorted, and
    /// backend weights normalized.
    pub fn normalized(&self) -> Self {
        let mut virtual_hosts: Vec<String> = self
            .virtual_hosts
            .iter()
            .map(|h| normalize_hostname(h))
            .filter(|h| !h.is_empty())
            .collect();
        virtual_hosts.sort();
        virtual_hosts.dedup();

        Self {
            name: self.name.clone(),
            address: self.address.clone(),
            virtual_hosts,
            backends: self.backends.iter().map(BackendConfig::normalized).collect(),
            balance: self.balance,
            check_interval: if self.check_interval == 0 {
                DEFAULT_CHECK_INTERVAL_MS
            } else {
                self.check_interval
            },
            fall: if self.fall == 0 { DEFAULT_FALL } else { self.fall },
            rise: if self.rise == 0 { DEFAULT_RISE } else { self.rise },
            client_timeout: self.client_timeout,
            server_timeout: self.server_timeout,
            connect_timeout: self.connect_timeout,
            error_pages: self.error_pages.clone(),
        }
    }

    /// Service level equality, ignoring backends.
    pub fn equal(&self, other: &ServiceConfig) -> bool {
        let mut a = self.normalized();
        let mut b = other.normalized();
        a.backends.clear();
        b.backends.clear();
        a == b
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.normalized().check_interval)
    }

    pub fn client_timeout(&self) -> Option<Duration> {
        millis(self.client_timeout)
    }

    pub fn server_timeout(&self) -> Option<Duration> {
        millis(self.server_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        millis(self.connect_timeout)
            .unwrap_or(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim surrounding whitespace and a trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().to_lowercase().trim_end_matches('.').to_string()
}

/// Live view of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStat {
    pub name: String,
    pub address: String,
    pub check_address: String,
    pub weight: u32,
    pub up: bool,
    pub sent: u64,
    pub rcvd: u64,
    pub errors: u64,
    pub conns: u64,
    pub active: u64,
    pub check_ok: u64,
    pub check_fail: u64,
}

/// Live view of one service and its backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStat {
    pub name: String,
    pub address: String,
    pub virtual_hosts: Vec<String>,
    pub balance: Balance,
    pub check_interval: u64,
    pub fall: u32,
    pub rise: u32,
    pub client_timeout: u64,
    pub server_timeout: u64,
    pub connect_timeout: u64,
    pub sent: u64,
    pub rcvd: u64,
    pub errors: u64,
    pub conns: u64,
    pub active: u64,
    pub http_active: u64,
    pub backends: Vec<BackendStat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", Balance::RoundRobin)]
    #[case("RR", Balance::RoundRobin)]
    #[case("rr", Balance::RoundRobin)]
    #[case("LC", Balance::LeastConn)]
    #[case(" lc ", Balance::LeastConn)]
    fn balance_parses(#[case] raw: &str, #[case] expected: Balance) {
        assert_eq!(raw.parse::<Balance>().unwrap(), expected);
    }

    #[test]
    fn balance_rejects_unknown() {
        assert!("WRR".parse::<Balance>().is_err());
        assert!(serde_json::from_str::<ServiceConfig>(r#"{"name":"a","balance":"XX"}"#).is_err());
    }

    #[test]
    fn defaults_compare_equal_to_explicit_values() {
        let implicit: ServiceConfig =
            serde_json::from_str(r#"{"name":"web","address":"127.0.0.1:9000"}"#).unwrap();
        let explicit: ServiceConfig = serde_json::from_str(
            r#"{"name":"web","address":"127.0.0.1:9000","balance":"RR",
                "check_interval":2000,"rise":2,"fall":2}"#,
        )
        .unwrap();

        assert_ne!(implicit, explicit);
        assert!(implicit.equal(&explicit));
        assert!(explicit.equal(&implicit));
    }

    #[test]
    fn empty_balance_string_is_round_robin() {
        let cfg: ServiceConfig = serde_json::from_str(r#"{"name":"web","balance":""}"#).unwrap();
        assert_eq!(cfg.balance, Balance::RoundRobin);
        assert!(cfg.equal(&ServiceConfig::new("web", "")));
    }

    #[test]
    fn equality_ignores_backends() {
        let mut a = ServiceConfig::new("web", "127.0.0.1:9000");
        let mut b = a.clone();
        a.backends.push(BackendConfig::new("b1", "127.0.0.1:1"));
        b.backends.push(BackendConfig::new("b2", "127.0.0.1:2"));
        assert!(a.equal(&b));
    }

    #[rstest]
    #[case::timeout(|c: &mut ServiceConfig| c.server_timeout = 500)]
    #[case::balance(|c: &mut ServiceConfig| c.balance = Balance::LeastConn)]
    #[case::address(|c: &mut ServiceConfig| c.address = "127.0.0.1:9001".to_string())]
    #[case::vhosts(|c: &mut ServiceConfig| c.virtual_hosts.push("example.test".to_string()))]
    #[case::error_pages(|c: &mut ServiceConfig| {
        c.error_pages.insert(503, "http://pages.test/503".to_string());
    })]
    fn differing_service_fields_are_unequal(#[case] change: fn(&mut ServiceConfig)) {
        let a = ServiceConfig::new("web", "127.0.0.1:9000");
        let mut b = a.clone();
        change(&mut b);
        assert!(!a.equal(&b));
    }

    #[test]
    fn virtual_host_order_and_case_do_not_matter() {
        let mut a = ServiceConfig::new("web", "");
        a.virtual_hosts = vec!["B.example".into(), "a.example.".into()];
        let mut b = ServiceConfig::new("web", "");
        b.virtual_hosts = vec!["a.example".into(), "b.example".into()];
        assert!(a.equal(&b));
        assert_eq!(a.normalized().virtual_hosts, vec!["a.example", "b.example"]);
    }

    #[test]
    fn backend_zero_weight_normalizes_to_one() {
        let mut a = BackendConfig::new("b1", "127.0.0.1:1");
        a.weight = 0;
        let b = BackendConfig::new("b1", "127.0.0.1:1");
        assert!(a.equal(&b));
        assert_eq!(a.normalized().weight, 1);
    }

    #[test]
    fn error_pages_use_numeric_keys() {
        let cfg: ServiceConfig = serde_json::from_str(
            r#"{"name":"web","error_pages":{"502":"http://pages.test/502"}}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.error_pages.get(&502).map(String::as_str),
            Some("http://pages.test/502")
        );
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let mut cfg = ServiceConfig::new("web", "");
        assert_eq!(cfg.client_timeout(), None);
        assert_eq!(cfg.server_timeout(), None);
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.check_interval(), Duration::from_millis(2000));

        cfg.client_timeout = 10;
        cfg.server_timeout = 20;
        cfg.connect_timeout = 30;
        assert_eq!(cfg.client_timeout(), Some(Duration::from_millis(10)));
        assert_eq!(cfg.server_timeout(), Some(Duration::from_millis(20)));
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(30));
    }
}
