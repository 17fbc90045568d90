use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use ifdns_proto::{Message, RecordType};
use tokio::task::JoinSet;

use super::{is_succeeded, DohResolver, MdnsResolver, QueryCtx, Resolve, SharedResolver, UdpResolver};
use crate::config::{DomainList, ProviderConfig};

/// One configured upstream with its matching policy.
pub struct Provider {
    name: String,
    priority: u8,
    types: Vec<RecordType>,
    domains: DomainList,
    ignore: DomainList,
    resolver: SharedResolver,
}

impl Provider {
    pub fn from_config(cfg: &ProviderConfig) -> anyhow::Result<Provider> {
        let resolver = resolver_for_endpoint(&cfg.name, &cfg.endpoint, cfg.timeout)
            .with_context(|| format!("provider '{}'", cfg.name))?;
        Provider::with_resolver(cfg, resolver)
    }

    pub fn with_resolver(cfg: &ProviderConfig, resolver: SharedResolver) -> anyhow::Result<Provider> {
        Ok(Provider {
            name: cfg.name.clone(),
            priority: cfg.priority.clamp(0, 255) as u8,
            types: parse_query_types(&cfg.types).with_context(|| format!("provider '{}'", cfg.name))?,
            domains: cfg.domains.clone(),
            ignore: cfg.ignore.clone(),
            resolver,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Suitability of this provider for `query`: `None` to skip, otherwise
    /// the domain match length in the high bits and the priority in the low
    /// byte, so longer suffix matches trump priority.
    pub fn match_query(&self, query: &Message) -> Option<i32> {
        if !query.has_single_question(None) {
            return None;
        }
        let question = &query.questions[0];
        if !self.types.contains(&question.rtype) {
            return None;
        }
        if self.ignore.matches(&question.name) > 0 {
            return None;
        }
        let score = self.domains.matches(&question.name);
        if score < 0 {
            return None;
        }
        Some(score << 8 | self.priority as i32)
    }
}

fn parse_query_types(types: &[String]) -> anyhow::Result<Vec<RecordType>> {
    types
        .iter()
        .map(|t| match t.as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            other => anyhow::bail!("unsupported query type '{other}'"),
        })
        .collect()
}

/// Picks the transport from the endpoint URL scheme.
pub fn resolver_for_endpoint(name: &str, endpoint: &str, timeout: Duration) -> anyhow::Result<SharedResolver> {
    if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        return Ok(Arc::new(DohResolver::new(name, endpoint, timeout)?));
    }
    if let Some(address) = endpoint.strip_prefix("dns://") {
        return Ok(Arc::new(UdpResolver::new(name, address, timeout)));
    }
    if let Some(group) = endpoint.strip_prefix("mdns://") {
        return Ok(Arc::new(MdnsResolver::new(name, group, timeout)));
    }
    anyhow::bail!("unsupported endpoint '{endpoint}'")
}

/// Dispatches a query across providers: groups by score, races each group in
/// parallel in descending score order, and returns the first succeeded
/// answer, cancelling the losers.
pub struct MultiResolver {
    providers: Vec<Arc<Provider>>,
}

impl MultiResolver {
    pub fn new(providers: Vec<Provider>) -> Self {
        MultiResolver {
            providers: providers.into_iter().map(Arc::new).collect(),
        }
    }
}

#[async_trait]
impl Resolve for MultiResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        let mut groups: BTreeMap<i32, Vec<Arc<Provider>>> = BTreeMap::new();
        for provider in &self.providers {
            if let Some(score) = provider.match_query(query) {
                groups.entry(score).or_default().push(provider.clone());
            }
        }
        if groups.is_empty() {
            let name = query.first_question().map(|q| q.name.as_str()).unwrap_or("");
            anyhow::bail!("no DNS provider is able to process the query for '{name}'");
        }

        let mut errors: Vec<anyhow::Error> = Vec::new();
        let mut bad_resp: Option<Message> = None;
        for group in groups.values().rev() {
            let outcome = if let [only] = group.as_slice() {
                match only.resolver.resolve(ctx, query).await {
                    Ok(resp) => Some(resp),
                    Err(e) => {
                        errors.push(e.context(format!("provider '{}'", only.name)));
                        None
                    }
                }
            } else {
                race_group(ctx, group, query, &mut errors).await
            };
            match outcome {
                Some(resp) if is_succeeded(&resp) => return Ok(resp),
                Some(resp) => {
                    if bad_resp.is_none() {
                        bad_resp = Some(resp);
                    }
                }
                None => {}
            }
        }

        if let Some(resp) = bad_resp {
            return Ok(resp);
        }
        let mut joined = String::from("all matching DNS providers failed:");
        for e in &errors {
            let _ = write!(joined, "\n  {e:#}");
        }
        Err(anyhow::anyhow!(joined))
    }
}

/// Races one score group. Returns the first succeeded response (cancelling
/// the rest), else some remembered non-success response, else `None` with
/// the errors collected.
async fn race_group(
    ctx: &QueryCtx,
    group: &[Arc<Provider>],
    query: &Message,
    errors: &mut Vec<anyhow::Error>,
) -> Option<Message> {
    let race_ctx = ctx.child();
    let mut tasks: JoinSet<(String, anyhow::Result<Message>)> = JoinSet::new();
    for provider in group {
        let provider = provider.clone();
        let task_ctx = race_ctx.clone();
        let query = query.clone();
        tasks.spawn(async move {
            let res = tokio::select! {
                _ = task_ctx.cancel.cancelled() => Err(anyhow::anyhow!("query cancelled")),
                res = provider.resolver.resolve(&task_ctx, &query) => res,
            };
            (provider.name.clone(), res)
        });
    }

    let mut bad_resp: Option<Message> = None;
    while let Some(joined) = tasks.join_next().await {
        let Ok((name, res)) = joined else {
            continue;
        };
        match res {
            Ok(resp) if is_succeeded(&resp) => {
                // Cancel the losers; dropping the JoinSet aborts their transports.
                race_ctx.cancel.cancel();
                return Some(resp);
            }
            Ok(resp) => {
                if bad_resp.is_none() {
                    bad_resp = Some(resp);
                }
            }
            Err(e) => errors.push(e.context(format!("provider '{name}'"))),
        }
    }
    bad_resp
}
