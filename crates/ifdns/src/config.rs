use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::Ipv4Net;

/// Ordered list of normalised domain suffixes (leading dot, no trailing dot).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainList(Vec<String>);

impl DomainList {
    pub fn from_suffixes<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        DomainList(suffixes.into_iter().map(|s| normalize_domain(s.as_ref())).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of the longest suffix matching `domain`: `0` for an empty list,
    /// `-1` when nothing matches.
    pub fn matches(&self, domain: &str) -> i32 {
        if self.0.is_empty() {
            return 0;
        }
        let domain = normalize_domain(domain);
        self.0
            .iter()
            .filter(|suffix| domain.ends_with(suffix.as_str()))
            .map(|suffix| suffix.len() as i32)
            .max()
            .unwrap_or(-1)
    }
}

impl<'de> Deserialize<'de> for DomainList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let suffixes = Vec::<String>::deserialize(deserializer)?;
        Ok(DomainList::from_suffixes(suffixes))
    }
}

fn normalize_domain(domain: &str) -> String {
    format!(".{}", domain.trim_matches('.'))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub addr: String,
    /// DoH/HTTP listener; falls back to `addr` when empty.
    pub http_addr: String,
    pub history: HistoryConfig,
    pub agent: AgentConfig,
    pub storage: StorageConfig,
    pub dns: DnsConfig,
    pub routing: RoutingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: "127.0.0.1:53".to_string(),
            http_addr: String::new(),
            history: HistoryConfig::default(),
            agent: AgentConfig::default(),
            storage: StorageConfig::default(),
            dns: DnsConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.http_addr.is_empty() {
            self.http_addr = self.addr.clone();
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub log_size: usize,
    pub dns_query_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            log_size: 2048,
            dns_query_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            base_url: "http://127.0.0.1:9911".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub file: PathBuf,
    #[serde(with = "humantime_serde")]
    pub save_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            file: PathBuf::from("dns-records.json"),
            save_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Upper bound applied to A answer TTLs; zero disables clamping.
    #[serde(with = "humantime_serde")]
    pub ttl_override: Duration,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    pub endpoint: String,
    #[serde(default)]
    pub ignore: DomainList,
    #[serde(default)]
    pub domains: DomainList,
    #[serde(with = "humantime_serde", default = "default_provider_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_provider_types")]
    pub types: Vec<String>,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_provider_types() -> Vec<String> {
    vec!["A".to_string(), "AAAA".to_string(), "CNAME".to_string()]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub rule: RuleConfig,
    pub reconcile: ReconcileConfig,
    #[serde(flatten)]
    pub dynamic: RoutingDynamic,
}

/// The single `ip rule` the controller maintains. Immutable after startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub table: u32,
    pub iif: String,
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

/// The reloadable part of the routing config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingDynamic {
    #[serde(with = "humantime_serde")]
    pub route_timeout: Duration,
    pub hosts: BTreeMap<String, DomainList>,
    #[serde(rename = "static")]
    pub static_routes: BTreeMap<String, Vec<Ipv4Net>>,
}

impl Default for RoutingDynamic {
    fn default() -> Self {
        RoutingDynamic {
            route_timeout: Duration::from_secs(4 * 3600),
            hosts: BTreeMap::new(),
            static_routes: BTreeMap::new(),
        }
    }
}

impl RoutingDynamic {
    /// Interface configured to carry traffic for `host`, if any.
    pub fn lookup_host(&self, host: &str) -> Option<&str> {
        self.hosts
            .iter()
            .find(|(_, domains)| domains.matches(host) > 0)
            .map(|(iface, _)| iface.as_str())
    }
}
