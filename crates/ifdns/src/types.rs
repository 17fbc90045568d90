use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::stream::{Cursor, CursorAware};

/// Prefix slot value meaning "plain host address, no prefix".
const NO_PREFIX: u8 = 33;

/// An IPv4 address with an optional prefix length. Ordering is
/// byte-lexicographic over the four octets and the prefix slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Net {
    octets: [u8; 4],
    prefix: u8,
}

impl Ipv4Net {
    pub fn host(addr: Ipv4Addr) -> Self {
        Ipv4Net {
            octets: addr.octets(),
            prefix: NO_PREFIX,
        }
    }

    pub fn with_prefix(addr: Ipv4Addr, prefix: u8) -> anyhow::Result<Self> {
        anyhow::ensure!(prefix <= 32, "prefix must be between 0 and 32, got {prefix}");
        Ok(Ipv4Net {
            octets: addr.octets(),
            prefix,
        })
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.octets)
    }

    pub fn has_prefix(&self) -> bool {
        self.prefix <= 32
    }

    pub fn prefix(&self) -> Option<u8> {
        self.has_prefix().then_some(self.prefix)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix() {
            Some(prefix) => write!(f, "{}/{}", self.addr(), prefix),
            None => write!(f, "{}", self.addr()),
        }
    }
}

impl FromStr for Ipv4Net {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None => {
                let addr: Ipv4Addr = s.parse().map_err(|_| anyhow::anyhow!("invalid IPv4 address '{s}'"))?;
                Ok(Ipv4Net::host(addr))
            }
            Some((addr, prefix)) => {
                let addr: Ipv4Addr = addr.parse().map_err(|_| anyhow::anyhow!("invalid IPv4 address '{s}'"))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid IPv4 prefix in '{s}'"))?;
                Ipv4Net::with_prefix(addr, prefix)
            }
        }
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Net {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e| D::Error::custom(format!("{e:#}")))
    }
}

/// A single observed `domain -> ip` binding with its absolute expiry time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub ip: Ipv4Net,
    pub domain: String,
    pub expires: DateTime<Utc>,
}

impl DnsRecord {
    pub fn new(domain: impl Into<String>, ip: Ipv4Net, expires: DateTime<Utc>) -> Self {
        DnsRecord {
            ip,
            domain: domain.into(),
            expires,
        }
    }

    /// True when the record has outlived its expiry by more than `slack`.
    pub fn expired_with(&self, slack: Duration) -> bool {
        Utc::now().signed_duration_since(self.expires) > chrono_duration(slack)
    }

    /// Remaining lifetime, truncated to whole seconds.
    pub fn ttl(&self) -> Duration {
        let remaining = self
            .expires
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_default();
        Duration::from_secs(remaining.as_secs())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// One routed resolution, as it appears on the dns-queries stream.
#[derive(Debug, Clone, Serialize)]
pub struct DnsQueryEvent {
    pub cursor: Cursor,
    pub time: DateTime<Utc>,
    pub client_addr: String,
    pub domain: String,
    pub ttl: u32,
    pub ips: Vec<Ipv4Net>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routed: Vec<String>,
}

impl CursorAware for DnsQueryEvent {
    fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }
}

/// Raw request/response text, as it appears on the dns-raw-queries stream.
#[derive(Debug, Clone, Serialize)]
pub struct DnsRawQueryEvent {
    pub cursor: Cursor,
    pub time: DateTime<Utc>,
    pub client_addr: String,
    pub response: bool,
    pub text: String,
}

impl CursorAware for DnsRawQueryEvent {
    fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_display_and_parse() {
        let plain: Ipv4Net = "10.0.0.5".parse().unwrap();
        assert_eq!(plain, Ipv4Net::host(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!plain.has_prefix());
        assert_eq!(plain.to_string(), "10.0.0.5");

        let network: Ipv4Net = "203.0.113.0/24".parse().unwrap();
        assert_eq!(network.prefix(), Some(24));
        assert_eq!(network.to_string(), "203.0.113.0/24");

        assert!("10.0.0.5/33".parse::<Ipv4Net>().is_err());
        assert!("10.0.0".parse::<Ipv4Net>().is_err());
        assert!("example.com".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn ipv4_orders_by_octets() {
        let mut ips: Vec<Ipv4Net> = ["203.0.113.8", "10.0.0.5", "203.0.113.7"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ips.sort();
        let rendered: Vec<String> = ips.iter().map(Ipv4Net::to_string).collect();
        assert_eq!(rendered, ["10.0.0.5", "203.0.113.7", "203.0.113.8"]);
    }

    #[test]
    fn record_expiry_and_ttl() {
        let ip = Ipv4Net::host(Ipv4Addr::new(10, 0, 0, 5));
        let live = DnsRecord::new("a.example.com", ip, Utc::now() + chrono::Duration::seconds(120));
        assert!(!live.expired_with(Duration::ZERO));
        assert!(live.ttl() <= Duration::from_secs(120));
        assert!(live.ttl() >= Duration::from_secs(118));

        let stale = DnsRecord::new("b.example.com", ip, Utc::now() - chrono::Duration::seconds(30));
        assert!(stale.expired_with(Duration::ZERO));
        assert!(!stale.expired_with(Duration::from_secs(60)));
        assert_eq!(stale.ttl(), Duration::ZERO);
    }

    #[test]
    fn record_snapshot_roundtrips_as_json() {
        let record = DnsRecord::new(
            "vpnhost.example.com",
            "10.0.0.5".parse().unwrap(),
            "2026-08-02T10:00:00Z".parse().unwrap(),
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"ip\":\"10.0.0.5\""), "unexpected json: {json}");
        let back: DnsRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
