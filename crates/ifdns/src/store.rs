use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;

use crate::types::{DnsRecord, Ipv4Net};

/// Observed `domain <-> ip` bindings, indexed both ways. All mutations go
/// through a single mutex; readers get owned snapshots.
pub struct DnsStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    by_domain: HashMap<String, HashMap<Ipv4Net, DnsRecord>>,
    by_ip: HashMap<Ipv4Net, HashMap<String, DnsRecord>>,
}

impl StoreInner {
    fn add(&mut self, record: DnsRecord) {
        self.by_domain
            .entry(record.domain.clone())
            .or_default()
            .insert(record.ip, record.clone());
        self.by_ip
            .entry(record.ip)
            .or_default()
            .insert(record.domain.clone(), record);
    }

    fn remove(&mut self, domain: &str, ip: Ipv4Net) {
        if let Some(ips) = self.by_domain.get_mut(domain) {
            ips.remove(&ip);
            if ips.is_empty() {
                self.by_domain.remove(domain);
            }
        }
        if let Some(domains) = self.by_ip.get_mut(&ip) {
            domains.remove(domain);
            if domains.is_empty() {
                self.by_ip.remove(&ip);
            }
        }
    }

    fn records(&self) -> Vec<DnsRecord> {
        self.by_domain.values().flat_map(|ips| ips.values().cloned()).collect()
    }

    fn fill(&mut self, records: Vec<DnsRecord>) {
        self.by_domain.clear();
        self.by_ip.clear();
        for record in records {
            self.add(record);
        }
    }
}

impl DnsStore {
    pub fn new() -> Self {
        DnsStore {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Inserts a record, overwriting any previous `(domain, ip)` entry.
    pub fn add(&self, record: DnsRecord) {
        self.lock().add(record);
    }

    pub fn remove(&self, record: &DnsRecord) {
        self.lock().remove(&record.domain, record.ip);
    }

    pub fn lookup_ip(&self, ip: Ipv4Net) -> Vec<DnsRecord> {
        self.lock()
            .by_ip
            .get(&ip)
            .map(|domains| domains.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<DnsRecord> {
        self.lock().records()
    }

    /// Drops every record that has outlived its expiry by more than `slack`.
    pub fn remove_expired(&self, slack: Duration) {
        let mut inner = self.lock();
        let expired: Vec<(String, Ipv4Net)> = inner
            .by_domain
            .values()
            .flat_map(|ips| ips.values())
            .filter(|record| record.expired_with(slack))
            .map(|record| (record.domain.clone(), record.ip))
            .collect();
        for (domain, ip) in expired {
            inner.remove(&domain, ip);
        }
    }

    /// Replaces the whole set with a snapshot from disk. A missing file
    /// leaves the store empty; a malformed one is an error.
    pub async fn load(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let records: Vec<DnsRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to decode DNS records from {}", path.display()))?;
        self.lock().fill(records);
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let records = self.records();
        let bytes = serde_json::to_vec(&records).context("failed to encode DNS records")?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

impl Default for DnsStore {
    fn default() -> Self {
        DnsStore::new()
    }
}
