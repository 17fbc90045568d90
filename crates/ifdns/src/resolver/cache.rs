use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hashlink::LinkedHashMap;
use ifdns_proto::{Message, Question, RecordType};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{QueryCtx, Resolve, SharedResolver};

struct CacheEntry {
    response: Message,
    expires: Instant,
}

/// Answer cache for single-question A queries. Entries expire at the minimum
/// positive answer TTL; hits are rewritten to the remaining TTL.
pub struct DnsCache {
    entries: Mutex<LinkedHashMap<Question, CacheEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        DnsCache {
            entries: Mutex::new(LinkedHashMap::new()),
        }
    }

    /// An unexpired copy of the cached response with `id` grafted in and
    /// answer TTLs counted down to the remaining seconds.
    pub fn get(&self, question: &Question, id: u16) -> Option<Message> {
        let entries = self.lock();
        let entry = entries.get(question)?;
        let now = Instant::now();
        if now >= entry.expires {
            return None;
        }
        let ttl = (entry.expires - now).as_secs_f64().ceil().max(1.0) as u32;
        let mut response = entry.response.clone();
        response.header.id = id;
        for record in &mut response.answers {
            record.ttl = ttl;
        }
        Some(response)
    }

    pub fn put(&self, question: Question, response: &Message) {
        let min_ttl = response.answers.iter().map(|r| r.ttl).filter(|&ttl| ttl > 0).min();
        let Some(min_ttl) = min_ttl else {
            return;
        };
        self.lock().insert(
            question,
            CacheEntry {
                response: response.clone(),
                expires: Instant::now() + Duration::from_secs(min_ttl as u64),
            },
        );
    }

    pub fn remove_expired(&self) {
        let mut entries = self.lock();
        let now = Instant::now();
        let expired: Vec<Question> = entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires)
            .map(|(question, _)| question.clone())
            .collect();
        for question in expired {
            entries.remove(&question);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkedHashMap<Question, CacheEntry>> {
        self.entries.lock().expect("cache lock poisoned")
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        DnsCache::new()
    }
}

/// Periodic sweep of expired cache entries.
pub fn spawn_cache_janitor(cache: Arc<DnsCache>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => cache.remove_expired(),
            }
        }
    })
}

/// Decorator that serves single-question A queries from [`DnsCache`].
pub struct CachedResolver {
    inner: SharedResolver,
    cache: Arc<DnsCache>,
}

impl CachedResolver {
    pub fn wrap(inner: SharedResolver, cache: Arc<DnsCache>) -> SharedResolver {
        Arc::new(CachedResolver { inner, cache })
    }
}

#[async_trait]
impl Resolve for CachedResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        if !query.has_single_question(Some(RecordType::A)) {
            return self.inner.resolve(ctx, query).await;
        }
        let question = &query.questions[0];
        if let Some(response) = self.cache.get(question, query.header.id) {
            return Ok(response);
        }
        let response = self.inner.resolve(ctx, query).await?;
        self.cache.put(question.clone(), &response);
        Ok(response)
    }
}
