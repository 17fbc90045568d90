use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::HttpAgentClient;
use crate::config::Config;
use crate::logging::setup_logging;
use crate::resolver::{
    spawn_cache_janitor, CachedResolver, DnsCache, MultiResolver, Provider, SafeResolver, SharedResolver,
    SingleFlightResolver, TtlClampResolver,
};
use crate::routing::RouteController;
use crate::server::{serve_http, DnsUdpServer};
use crate::service::DnsRoutingService;
use crate::store::DnsStore;
use crate::Args;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct App;

impl App {
    pub async fn run_until_completion(args: Args) -> anyhow::Result<()> {
        let cfg = Config::load(&args.config)?;
        let _log_stream = setup_logging(args.debug, cfg.history.log_size)?;

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("stop signal received");
                    cancel.cancel();
                }
            }
        });

        let store = Arc::new(DnsStore::new());
        store
            .load(&cfg.storage.file)
            .await
            .context("failed to load the DNS store snapshot")?;
        spawn_store_saver(
            store.clone(),
            cfg.storage.file.clone(),
            cfg.storage.save_interval,
            cancel.clone(),
        );

        let agent = Arc::new(HttpAgentClient::new(cfg.agent.base_url.clone(), cfg.agent.timeout)?);
        let routes = RouteController::new(cfg.routing.clone(), store.clone(), agent);
        routes.start(cancel.clone()).await;
        spawn_config_watcher(args.config.clone(), routes.clone(), cancel.clone());

        let providers = cfg
            .dns
            .providers
            .iter()
            .map(Provider::from_config)
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to configure DNS providers")?;
        let service = Arc::new(DnsRoutingService::new(
            Arc::new(MultiResolver::new(providers)),
            store.clone(),
            routes.clone(),
            cfg.history.dns_query_size,
        ));

        let cache = Arc::new(DnsCache::new());
        spawn_cache_janitor(cache.clone(), CACHE_SWEEP_INTERVAL, cancel.clone());

        // The clamp sits below the cache so cached entries expire within the
        // override window as well.
        let resolver: SharedResolver = CachedResolver::wrap(
            TtlClampResolver::wrap(SingleFlightResolver::wrap(service.clone()), cfg.dns.ttl_override),
            cache,
        );

        let udp_server = DnsUdpServer::bind(&cfg.addr, SafeResolver::wrap(resolver.clone())).await?;
        let mut servers: JoinSet<anyhow::Result<()>> = JoinSet::new();
        servers.spawn(udp_server.serve(cancel.clone()));
        servers.spawn(serve_http(cfg.http_addr.clone(), resolver, cancel.clone()));

        let mut first_failure = None;
        while let Some(result) = servers.join_next().await {
            if let Err(e) = result.context("server task failed to execute")? {
                tracing::error!("server failed: {e:#}");
                first_failure.get_or_insert(e);
                cancel.cancel();
            }
        }

        // One more snapshot so restarts resume with warm routes.
        if let Err(e) = store.save(&cfg.storage.file).await {
            tracing::error!("failed to save the DNS store snapshot: {e:#}");
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_store_saver(store: Arc<DnsStore>, file: PathBuf, period: Duration, cancel: CancellationToken) {
    if period.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match store.save(&file).await {
                        Ok(()) => tracing::debug!(file = %file.display(), "DNS store saved"),
                        Err(e) => tracing::error!("failed to save the DNS store snapshot: {e:#}"),
                    }
                }
            }
        }
    });
}

/// Polls the config file's mtime and applies the dynamic routing section on
/// change. The rule part is immutable and stays as loaded at startup.
fn spawn_config_watcher(path: PathBuf, routes: Arc<RouteController>, cancel: CancellationToken) {
    fn modified(path: &Path) -> Option<std::time::SystemTime> {
        std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
    }

    tokio::spawn(async move {
        let mut last = modified(&path);
        let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(current) = modified(&path) else { continue };
                    if last.map_or(true, |last| current > last) {
                        match Config::load(&path) {
                            Ok(cfg) => {
                                tracing::info!("config change detected");
                                routes.update_config(cfg.routing.dynamic).await;
                                last = Some(current);
                            }
                            Err(e) => tracing::error!("failed to reload config: {e:#}"),
                        }
                    }
                }
            }
        }
    });
}
