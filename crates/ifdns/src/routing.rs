use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRoute, NetworkAgent};
use crate::config::{ReconcileConfig, RoutingConfig, RoutingDynamic, RuleConfig};
use crate::store::DnsStore;
use crate::types::{DnsRecord, Ipv4Net};

/// A policy route inside the controller's table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IpRoute {
    pub table: u32,
    pub iface: String,
    pub addr: Ipv4Net,
}

impl IpRoute {
    fn to_agent(&self) -> AgentRoute {
        AgentRoute {
            table: self.table,
            iface: self.iface.clone(),
            address: self.addr.to_string(),
        }
    }
}

impl fmt::Display for IpRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev {} table {}", self.addr, self.iface, self.table)
    }
}

/// A desired route enriched with the store records that back it.
#[derive(Debug, Clone, Serialize)]
pub struct IpRouteDns {
    #[serde(flatten)]
    pub route: IpRoute,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_records: Vec<DnsRecord>,
}

struct RouteJob {
    route: IpRoute,
    /// Acknowledged once the agent call has been attempted.
    done: Option<oneshot::Sender<()>>,
}

/// Maintains the desired set of policy routes and converges the kernel
/// towards it through the agent. All kernel mutations flow through a single
/// worker task; reconciliation passes are mutually exclusive.
pub struct RouteController {
    rule: RuleConfig,
    reconcile_cfg: ReconcileConfig,
    dynamic: std::sync::RwLock<Arc<RoutingDynamic>>,
    store: Arc<DnsStore>,
    agent: Arc<dyn NetworkAgent>,
    /// Routes the controller wants to exist. Snapshot and mutation share this
    /// lock, so `routes()` never observes a half-reconciled set.
    desired: RwLock<HashSet<IpRoute>>,
    add_tx: UnboundedSender<RouteJob>,
    delete_tx: UnboundedSender<IpRoute>,
    queues: std::sync::Mutex<Option<(UnboundedReceiver<RouteJob>, UnboundedReceiver<IpRoute>)>>,
    reconcile_mu: Mutex<()>,
}

impl RouteController {
    pub fn new(cfg: RoutingConfig, store: Arc<DnsStore>, agent: Arc<dyn NetworkAgent>) -> Arc<RouteController> {
        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        Arc::new(RouteController {
            rule: cfg.rule,
            reconcile_cfg: cfg.reconcile,
            dynamic: std::sync::RwLock::new(Arc::new(cfg.dynamic)),
            store,
            agent,
            desired: RwLock::new(HashSet::new()),
            add_tx,
            delete_tx,
            queues: std::sync::Mutex::new(Some((add_rx, delete_rx))),
            reconcile_mu: Mutex::new(()),
        })
    }

    /// Seeds the desired set from the store, runs the first reconcile and
    /// spawns the worker and the periodic reconcile loop.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let (add_rx, delete_rx) = self
            .queues
            .lock()
            .expect("controller lock poisoned")
            .take()
            .expect("controller started twice");
        self.seed_from_store().await;
        tokio::spawn(self.clone().run_worker(add_rx, delete_rx, cancel.clone()));
        self.reconcile().await;
        tokio::spawn(self.clone().run_reconcile_loop(cancel));
    }

    pub fn rule(&self) -> &RuleConfig {
        &self.rule
    }

    /// Interface configured to carry traffic for `host`, if any.
    pub fn lookup_host(&self, host: &str) -> Option<String> {
        self.dynamic().lookup_host(host).map(str::to_string)
    }

    /// Swaps the dynamic config (the rule is immutable) and reconciles now.
    pub async fn update_config(&self, dynamic: RoutingDynamic) {
        *self.dynamic.write().expect("config lock poisoned") = Arc::new(dynamic);
        tracing::info!("routing config updated");
        self.reconcile().await;
    }

    /// Requests a route for a freshly observed address. Blocks until the
    /// kernel mutation has been attempted, successfully or not.
    pub async fn add_route(&self, iface: &str, ip: Ipv4Net) {
        let route = IpRoute {
            table: self.rule.table,
            iface: iface.to_string(),
            addr: ip,
        };
        if self.desired.read().await.contains(&route) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .add_tx
            .send(RouteJob {
                route,
                done: Some(done_tx),
            })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Snapshot of the desired set, each route enriched with its live records.
    pub async fn routes(&self) -> Vec<IpRouteDns> {
        let cfg = self.dynamic();
        let desired = self.desired.read().await;
        desired
            .iter()
            .map(|route| {
                let mut records: Vec<DnsRecord> = self
                    .store
                    .lookup_ip(route.addr)
                    .into_iter()
                    .filter(|record| !record.expired_with(cfg.route_timeout))
                    .collect();
                records.sort_by(|a, b| a.domain.cmp(&b.domain));
                IpRouteDns {
                    route: route.clone(),
                    dns_records: records,
                }
            })
            .collect()
    }

    pub async fn reconcile(&self) {
        let _guard = self.reconcile_mu.lock().await;
        let cfg = self.dynamic();
        self.store.remove_expired(cfg.route_timeout);
        if tokio::time::timeout(self.reconcile_cfg.timeout, self.reconcile_rules())
            .await
            .is_err()
        {
            tracing::warn!("rule reconciliation timed out");
        }
        if tokio::time::timeout(self.reconcile_cfg.timeout, self.reconcile_routes(&cfg))
            .await
            .is_err()
        {
            tracing::warn!("route reconciliation timed out");
        }
    }

    fn dynamic(&self) -> Arc<RoutingDynamic> {
        self.dynamic.read().expect("config lock poisoned").clone()
    }

    async fn seed_from_store(&self) {
        let cfg = self.dynamic();
        let mut desired = self.desired.write().await;
        for record in self.store.records() {
            if let Some(iface) = cfg.lookup_host(&record.domain) {
                desired.insert(IpRoute {
                    table: self.rule.table,
                    iface: iface.to_string(),
                    addr: record.ip,
                });
            }
        }
    }

    async fn reconcile_rules(&self) {
        match self.agent.has_rule(&self.rule).await {
            Ok(true) => {}
            Ok(false) => match self.agent.add_rule(&self.rule).await {
                Ok(()) => tracing::info!(table = self.rule.table, iif = %self.rule.iif, "rule added"),
                Err(e) => tracing::error!("failed to add rule: {e:#}"),
            },
            Err(e) => tracing::error!("failed to check if rule exists: {e:#}"),
        }
    }

    async fn reconcile_routes(&self, cfg: &RoutingDynamic) {
        let mut desired = self.desired.write().await;

        let defined: HashSet<IpRoute> = match self.agent.list_routes(self.rule.table).await {
            Ok(routes) => routes
                .into_iter()
                .filter_map(|route| match route.address.parse::<Ipv4Net>() {
                    Ok(addr) => Some(IpRoute {
                        table: route.table,
                        iface: route.iface,
                        addr,
                    }),
                    Err(e) => {
                        tracing::warn!(addr = %route.address, "unexpected route address: {e:#}");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                tracing::error!(table = self.rule.table, "failed to load route table: {e:#}");
                HashSet::new()
            }
        };

        let mut unknown = defined.clone();
        let mut next_desired: HashSet<IpRoute> = HashSet::new();
        {
            let mut ensure_route = |route: &IpRoute| {
                if defined.contains(route) {
                    unknown.remove(route);
                } else {
                    let _ = self.add_tx.send(RouteJob {
                        route: route.clone(),
                        done: None,
                    });
                }
            };

            for route in desired.iter() {
                let backed = self
                    .store
                    .lookup_ip(route.addr)
                    .iter()
                    .any(|record| !record.expired_with(cfg.route_timeout));
                if backed {
                    next_desired.insert(route.clone());
                    ensure_route(route);
                }
            }

            for (iface, addresses) in &cfg.static_routes {
                for addr in addresses {
                    let route = IpRoute {
                        table: self.rule.table,
                        iface: iface.clone(),
                        addr: *addr,
                    };
                    next_desired.insert(route.clone());
                    ensure_route(&route);
                }
            }
        }

        // Whatever the kernel has beyond the desired set gets deleted.
        for route in unknown {
            let _ = self.delete_tx.send(route);
        }
        *desired = next_desired;
    }

    async fn run_worker(
        self: Arc<Self>,
        mut add_rx: UnboundedReceiver<RouteJob>,
        mut delete_rx: UnboundedReceiver<IpRoute>,
        cancel: CancellationToken,
    ) {
        loop {
            // `biased` polls the add queue before the delete queue, so adds
            // win whenever both are pending.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(job) = add_rx.recv() => self.apply_add(job).await,
                Some(route) = delete_rx.recv() => self.apply_delete(route).await,
            }
        }
    }

    async fn run_reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.reconcile_cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate tick; the initial reconcile already ran in start().
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }

    async fn apply_add(&self, job: RouteJob) {
        match self.agent.add_route(&job.route.to_agent()).await {
            Ok(()) => {
                tracing::info!(route = %job.route, "route added");
                self.desired.write().await.insert(job.route);
            }
            Err(e) => tracing::error!(route = %job.route, "failed to add route: {e:#}"),
        }
        if let Some(done) = job.done {
            let _ = done.send(());
        }
    }

    async fn apply_delete(&self, route: IpRoute) {
        match self.agent.delete_route(&route.to_agent()).await {
            Ok(()) => tracing::info!(route = %route, "route deleted"),
            Err(e) => tracing::error!(route = %route, "failed to delete route: {e:#}"),
        }
    }
}
