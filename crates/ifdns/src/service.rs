use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ifdns_proto::{Message, RData, RecordType};

use crate::resolver::{QueryCtx, Resolve, SharedResolver};
use crate::routing::RouteController;
use crate::store::DnsStore;
use crate::stream::{BufferedStream, Cursor};
use crate::types::{DnsQueryEvent, DnsRawQueryEvent, DnsRecord, Ipv4Net};

/// Top of the resolver pipeline: records raw traffic, and for A answers walks
/// the CNAME chain to decide which interface the addresses belong to, feeding
/// the store and the route controller.
pub struct DnsRoutingService {
    inner: SharedResolver,
    store: Arc<DnsStore>,
    routes: Arc<RouteController>,
    query_stream: Arc<BufferedStream<DnsQueryEvent>>,
    raw_query_stream: Arc<BufferedStream<DnsRawQueryEvent>>,
}

impl DnsRoutingService {
    pub fn new(
        inner: SharedResolver,
        store: Arc<DnsStore>,
        routes: Arc<RouteController>,
        history_size: usize,
    ) -> Self {
        DnsRoutingService {
            inner,
            store,
            routes,
            query_stream: Arc::new(BufferedStream::new(history_size)),
            raw_query_stream: Arc::new(BufferedStream::new(history_size)),
        }
    }

    pub fn query_stream(&self) -> Arc<BufferedStream<DnsQueryEvent>> {
        self.query_stream.clone()
    }

    pub fn raw_query_stream(&self) -> Arc<BufferedStream<DnsRawQueryEvent>> {
        self.raw_query_stream.clone()
    }

    fn append_raw(&self, ctx: &QueryCtx, response: bool, text: String) {
        self.raw_query_stream.append(DnsRawQueryEvent {
            cursor: Cursor::HEAD,
            time: Utc::now(),
            client_addr: ctx.client_addr.clone(),
            response,
            text,
        });
    }

    async fn process_a_response(&self, ctx: &QueryCtx, requested: &str, response: &Message) {
        let mut cnames: HashMap<&str, (&str, u32)> = HashMap::new();
        let mut name_ips: HashMap<&str, Vec<Ipv4Net>> = HashMap::new();
        let mut ttl = u32::MAX;
        for record in &response.answers {
            match &record.data {
                RData::A(addr) => {
                    name_ips
                        .entry(record.name.as_str())
                        .or_default()
                        .push(Ipv4Net::host(*addr));
                    ttl = ttl.min(record.ttl);
                }
                RData::Cname(target) => {
                    cnames.insert(record.name.as_str(), (target.as_str(), record.ttl));
                }
                _ => {}
            }
        }

        let mut ips: Vec<Ipv4Net> = Vec::new();
        let mut ifaces: Vec<String> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut name = requested;
        while !visited.contains(name) {
            if let Some(iface) = self.routes.lookup_host(normalize_name(name)) {
                if !ifaces.contains(&iface) {
                    ifaces.push(iface);
                }
            }
            match cnames.get(name) {
                Some(&(target, cname_ttl)) => {
                    visited.insert(name);
                    ttl = ttl.min(cname_ttl);
                    name = target;
                }
                None => {
                    ips = name_ips.get(name).cloned().unwrap_or_default();
                    break;
                }
            }
        }

        if ips.is_empty() {
            return;
        }
        ips.sort();

        let event = DnsQueryEvent {
            cursor: Cursor::HEAD,
            time: Utc::now(),
            client_addr: ctx.client_addr.clone(),
            domain: normalize_name(requested).to_string(),
            ttl: ttl.max(1),
            ips,
            routed: ifaces,
        };
        self.query_stream.append(event.clone());

        let expires = event.time + chrono::Duration::seconds(event.ttl as i64);
        for &ip in &event.ips {
            self.store.add(DnsRecord::new(event.domain.clone(), ip, expires));
            for iface in &event.routed {
                self.routes.add_route(iface, ip).await;
            }
        }
        tracing::debug!(
            domain = %event.domain,
            ips = event.ips.len(),
            client_addr = %event.client_addr,
            "domain resolved"
        );
    }
}

#[async_trait]
impl Resolve for DnsRoutingService {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        self.append_raw(ctx, false, query.to_string());

        let response = match self.inner.resolve(ctx, query).await {
            Ok(response) => response,
            Err(e) => {
                self.append_raw(ctx, true, format!("ERROR: query (id: {}) failed: {e:#}", query.header.id));
                return Err(e);
            }
        };
        self.append_raw(ctx, true, response.to_string());

        if query.has_single_question(Some(RecordType::A)) {
            self.process_a_response(ctx, &query.questions[0].name, &response).await;
        }

        Ok(response)
    }
}

fn normalize_name(name: &str) -> &str {
    name.trim_end_matches('.')
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use ifdns_proto::{Rcode, Record};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::agent::{AgentRoute, NetworkAgent};
    use crate::config::{DomainList, RoutingConfig, RuleConfig};
    use crate::resolver::testing::{a_query, a_response, ScriptedResolver};

    /// Agent stub that remembers added routes and succeeds at everything.
    #[derive(Default)]
    struct SilentAgent {
        added: std::sync::Mutex<Vec<AgentRoute>>,
    }

    #[async_trait]
    impl NetworkAgent for SilentAgent {
        async fn has_rule(&self, _rule: &RuleConfig) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn add_rule(&self, _rule: &RuleConfig) -> anyhow::Result<()> {
            Ok(())
        }

        async fn list_routes(&self, _table: u32) -> anyhow::Result<Vec<AgentRoute>> {
            Ok(Vec::new())
        }

        async fn add_route(&self, route: &AgentRoute) -> anyhow::Result<()> {
            self.added.lock().unwrap().push(route.clone());
            Ok(())
        }

        async fn delete_route(&self, _route: &AgentRoute) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        service: DnsRoutingService,
        store: Arc<DnsStore>,
        agent: Arc<SilentAgent>,
    }

    async fn fixture(upstream: SharedResolver, hosts: &[(&str, &[&str])]) -> Fixture {
        let mut cfg = RoutingConfig::default();
        cfg.rule = RuleConfig {
            table: 1000,
            iif: "br0".to_string(),
            priority: 2000,
        };
        cfg.dynamic.route_timeout = Duration::from_secs(3600);
        for (iface, domains) in hosts {
            cfg.dynamic
                .hosts
                .insert(iface.to_string(), DomainList::from_suffixes(domains.iter().copied()));
        }

        let store = Arc::new(DnsStore::new());
        let agent = Arc::new(SilentAgent::default());
        let routes = RouteController::new(cfg, store.clone(), agent.clone());
        routes.start(CancellationToken::new()).await;

        Fixture {
            service: DnsRoutingService::new(upstream, store.clone(), routes, 64),
            store,
            agent,
        }
    }

    fn added_addresses(agent: &SilentAgent) -> Vec<(String, String)> {
        agent
            .added
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.iface.clone(), r.address.clone()))
            .collect()
    }

    #[tokio::test]
    async fn routed_domain_with_a_direct_a_answer() {
        let upstream = Arc::new(ScriptedResolver::answering(a_response(
            "vpnhost.example.com",
            120,
            &[Ipv4Addr::new(10, 0, 0, 5)],
        )));
        let f = fixture(upstream, &[("wg0", &["vpnhost.example.com"])]).await;
        let ctx = QueryCtx::new(CancellationToken::new(), "192.168.1.2:51234");

        let resp = f
            .service
            .resolve(&ctx, &a_query("vpnhost.example.com"))
            .await
            .unwrap();
        assert_eq!(resp.answers.len(), 1);

        let events = f.service.query_stream().query(Cursor::HEAD, 10, None);
        assert_eq!(events.items.len(), 1);
        let event = &events.items[0];
        assert_eq!(event.domain, "vpnhost.example.com");
        assert_eq!(event.ttl, 120);
        assert_eq!(event.client_addr, "192.168.1.2:51234");
        assert_eq!(event.ips.iter().map(Ipv4Net::to_string).collect::<Vec<_>>(), ["10.0.0.5"]);
        assert_eq!(event.routed, ["wg0"]);

        let records = f.store.lookup_ip("10.0.0.5".parse().unwrap());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain, "vpnhost.example.com");
        let ttl = records[0].ttl();
        assert!(ttl > Duration::from_secs(110) && ttl <= Duration::from_secs(120));

        assert_eq!(added_addresses(&f.agent), [("wg0".to_string(), "10.0.0.5".to_string())]);

        let raw = f.service.raw_query_stream().query(Cursor::HEAD, 10, None);
        assert_eq!(raw.items.len(), 2);
        assert!(!raw.items[0].response);
        assert!(raw.items[1].response);
        assert!(raw.items[1].text.contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn routed_domain_via_cname_chain() {
        let mut reply = a_response("alias.example.com", u32::MAX, &[]);
        reply.answers.push(Record::new(
            "alias.example.com",
            300,
            RData::Cname("target.cdn.net".into()),
        ));
        reply
            .answers
            .push(Record::new("target.cdn.net", 30, RData::A(Ipv4Addr::new(203, 0, 113, 7))));
        reply
            .answers
            .push(Record::new("target.cdn.net", 60, RData::A(Ipv4Addr::new(203, 0, 113, 8))));

        let f = fixture(
            Arc::new(ScriptedResolver::answering(reply)),
            &[("wg0", &["alias.example.com"])],
        )
        .await;
        let ctx = QueryCtx::default();

        f.service.resolve(&ctx, &a_query("alias.example.com")).await.unwrap();

        let events = f.service.query_stream().query(Cursor::HEAD, 10, None);
        let event = &events.items[0];
        assert_eq!(event.domain, "alias.example.com");
        assert_eq!(event.ttl, 30, "minimum across the chain");
        assert_eq!(
            event.ips.iter().map(Ipv4Net::to_string).collect::<Vec<_>>(),
            ["203.0.113.7", "203.0.113.8"],
            "sorted"
        );
        assert_eq!(event.routed, ["wg0"]);

        let added = added_addresses(&f.agent);
        assert_eq!(added.len(), 2);
        assert!(added.contains(&("wg0".to_string(), "203.0.113.7".to_string())));
        assert!(added.contains(&("wg0".to_string(), "203.0.113.8".to_string())));
    }

    #[tokio::test]
    async fn cname_loop_terminates_without_ips() {
        let mut reply = a_response("loop.example.com", u32::MAX, &[]);
        reply
            .answers
            .push(Record::new("loop.example.com", 60, RData::Cname("b.example.com".into())));
        reply
            .answers
            .push(Record::new("b.example.com", 60, RData::Cname("loop.example.com".into())));

        let f = fixture(
            Arc::new(ScriptedResolver::answering(reply)),
            &[("wg0", &["example.com"])],
        )
        .await;

        f.service
            .resolve(&QueryCtx::default(), &a_query("loop.example.com"))
            .await
            .unwrap();

        assert!(f.service.query_stream().query(Cursor::HEAD, 10, None).items.is_empty());
        assert!(f.store.records().is_empty());
        assert!(added_addresses(&f.agent).is_empty());
    }

    #[tokio::test]
    async fn unrouted_domains_reach_the_store_but_not_the_controller() {
        let upstream = Arc::new(ScriptedResolver::answering(a_response(
            "plain.example.org",
            60,
            &[Ipv4Addr::new(198, 51, 100, 7)],
        )));
        let f = fixture(upstream, &[("wg0", &["example.com"])]).await;

        f.service
            .resolve(&QueryCtx::default(), &a_query("plain.example.org"))
            .await
            .unwrap();

        assert_eq!(f.store.records().len(), 1);
        assert!(added_addresses(&f.agent).is_empty());
        let events = f.service.query_stream().query(Cursor::HEAD, 10, None);
        assert!(events.items[0].routed.is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_are_recorded_on_the_raw_stream() {
        let f = fixture(Arc::new(ScriptedResolver::failing()), &[]).await;
        let err = f
            .service
            .resolve(&QueryCtx::default(), &a_query("x.example.com"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scripted failure"));

        let raw = f.service.raw_query_stream().query(Cursor::HEAD, 10, None);
        assert_eq!(raw.items.len(), 2);
        assert!(raw.items[1].response);
        assert!(raw.items[1].text.starts_with("ERROR:"));
    }

    #[tokio::test]
    async fn non_a_questions_skip_route_processing() {
        let mut reply = a_response("v6.example.com", 60, &[]);
        reply.header.rcode = Rcode::NoError;
        let upstream = Arc::new(ScriptedResolver::answering(reply));
        let f = fixture(upstream, &[("wg0", &["example.com"])]).await;

        let mut query = a_query("v6.example.com");
        query.questions[0].rtype = RecordType::Aaaa;
        f.service.resolve(&QueryCtx::default(), &query).await.unwrap();

        assert!(f.store.records().is_empty());
        assert!(f.service.query_stream().query(Cursor::HEAD, 10, None).items.is_empty());
    }
}
