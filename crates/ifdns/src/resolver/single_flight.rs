use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use ifdns_proto::{Message, Question};
use tokio_util::sync::CancellationToken;

use super::{QueryCtx, Resolve, SharedResolver};

struct Inflight {
    done: CancellationToken,
    /// `Some` when the leader succeeded; `None` when it failed.
    result: OnceLock<Option<Message>>,
}

/// Coalesces concurrent identical single-question queries into one upstream
/// call. Success is shared with followers (with their own message id grafted
/// in); errors are not, so a follower retries as the new leader.
pub struct SingleFlightResolver {
    inner: SharedResolver,
    inflight: Mutex<HashMap<Question, Arc<Inflight>>>,
}

impl SingleFlightResolver {
    pub fn wrap(inner: SharedResolver) -> SharedResolver {
        Arc::new(SingleFlightResolver {
            inner,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, HashMap<Question, Arc<Inflight>>> {
        self.inflight.lock().expect("single-flight lock poisoned")
    }
}

#[async_trait]
impl Resolve for SingleFlightResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        if !query.has_single_question(None) {
            return self.inner.resolve(ctx, query).await;
        }
        let key = query.questions[0].clone();

        loop {
            let lead = Arc::new(Inflight {
                done: CancellationToken::new(),
                result: OnceLock::new(),
            });
            let pending = {
                let mut ledger = self.ledger();
                match ledger.get(&key) {
                    Some(pending) => Some(pending.clone()),
                    None => {
                        ledger.insert(key.clone(), lead.clone());
                        None
                    }
                }
            };

            let Some(pending) = pending else {
                let res = self.inner.resolve(ctx, query).await;
                let _ = lead.result.set(res.as_ref().ok().cloned());
                lead.done.cancel();
                let mut ledger = self.ledger();
                if ledger.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, &lead)) {
                    ledger.remove(&key);
                }
                return res;
            };

            tokio::select! {
                _ = ctx.cancel.cancelled() => anyhow::bail!("query cancelled while waiting for an identical in-flight query"),
                _ = pending.done.cancelled() => {
                    if let Some(resp) = pending.result.get().and_then(|r| r.as_ref()) {
                        let mut resp = resp.clone();
                        resp.header.id = query.header.id;
                        return Ok(resp);
                    }
                    // The leader failed; don't cement its error, retry as the new leader.
                }
            }
        }
    }
}
