//! Shared fixtures for the integration tests: a scripted upstream, an
//! in-memory agent, and the fully assembled resolver chain.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ifdns::agent::{AgentRoute, NetworkAgent};
use ifdns::config::{DomainList, ProviderConfig, RoutingConfig, RuleConfig};
use ifdns::resolver::{
    CachedResolver, DnsCache, MultiResolver, Provider, QueryCtx, Resolve, SharedResolver, SingleFlightResolver,
    TtlClampResolver,
};
use ifdns::routing::RouteController;
use ifdns::service::DnsRoutingService;
use ifdns::store::DnsStore;
use ifdns_proto::{Message, RData, Rcode, Record, RecordType};
use tokio_util::sync::CancellationToken;

/// Upstream stub: answers every query with the configured reply after an
/// optional delay, counting calls.
pub struct Upstream {
    reply: Message,
    delay: Duration,
    calls: AtomicUsize,
}

impl Upstream {
    pub fn new(reply: Message) -> Arc<Upstream> {
        Arc::new(Upstream {
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(reply: Message, delay: Duration) -> Arc<Upstream> {
        Arc::new(Upstream {
            reply,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for Upstream {
    async fn resolve(&self, _ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut reply = self.reply.clone();
        reply.header.id = query.header.id;
        Ok(reply)
    }
}

/// Agent stub with an in-memory kernel table.
#[derive(Default)]
pub struct FakeAgent {
    pub kernel: Mutex<HashSet<AgentRoute>>,
    pub added: Mutex<Vec<AgentRoute>>,
}

#[async_trait]
impl NetworkAgent for FakeAgent {
    async fn has_rule(&self, _rule: &RuleConfig) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn add_rule(&self, _rule: &RuleConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_routes(&self, table: u32) -> anyhow::Result<Vec<AgentRoute>> {
        Ok(self
            .kernel
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    async fn add_route(&self, route: &AgentRoute) -> anyhow::Result<()> {
        self.kernel.lock().unwrap().insert(route.clone());
        self.added.lock().unwrap().push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &AgentRoute) -> anyhow::Result<()> {
        self.kernel.lock().unwrap().remove(route);
        Ok(())
    }
}

pub struct Pipeline {
    pub resolver: SharedResolver,
    pub service: Arc<DnsRoutingService>,
    pub store: Arc<DnsStore>,
    pub agent: Arc<FakeAgent>,
}

/// The production chain (cache -> clamp -> single-flight -> routing service
/// -> dispatcher) over a single scripted provider and a fake agent.
pub async fn pipeline(upstream: SharedResolver, ttl_override: Duration, hosts: &[(&str, &[&str])]) -> Pipeline {
    let mut routing = RoutingConfig::default();
    routing.rule = RuleConfig {
        table: 1000,
        iif: "br0".to_string(),
        priority: 2000,
    };
    routing.dynamic.route_timeout = Duration::from_secs(3600);
    for (iface, domains) in hosts {
        routing
            .dynamic
            .hosts
            .insert(iface.to_string(), DomainList::from_suffixes(domains.iter().copied()));
    }

    let store = Arc::new(DnsStore::new());
    let agent = Arc::new(FakeAgent::default());
    let routes = RouteController::new(routing, store.clone(), agent.clone());
    routes.start(CancellationToken::new()).await;

    let provider_cfg = ProviderConfig {
        name: "test".to_string(),
        priority: 5,
        endpoint: "dns://ignored:53".to_string(),
        ignore: DomainList::default(),
        domains: DomainList::default(),
        timeout: Duration::from_secs(5),
        types: vec!["A".to_string(), "AAAA".to_string(), "CNAME".to_string()],
    };
    let provider = Provider::with_resolver(&provider_cfg, upstream).unwrap();

    let service = Arc::new(DnsRoutingService::new(
        Arc::new(MultiResolver::new(vec![provider])),
        store.clone(),
        routes,
        256,
    ));

    let resolver = CachedResolver::wrap(
        TtlClampResolver::wrap(SingleFlightResolver::wrap(service.clone()), ttl_override),
        Arc::new(DnsCache::new()),
    );

    Pipeline {
        resolver,
        service,
        store,
        agent,
    }
}

pub fn a_reply(name: &str, ttl: u32, addrs: &[Ipv4Addr]) -> Message {
    let query = Message::query(0, name, RecordType::A);
    let mut reply = Message::reply_to(&query, Rcode::NoError);
    for addr in addrs {
        reply.answers.push(Record::new(name, ttl, RData::A(*addr)));
    }
    reply
}

pub fn query(id: u16, name: &str) -> Message {
    Message::query(id, name, RecordType::A)
}
