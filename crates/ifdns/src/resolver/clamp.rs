use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ifdns_proto::{Message, RecordType};

use super::{QueryCtx, Resolve, SharedResolver};

/// Clamps A answer TTLs to a configured maximum. Identity when the maximum
/// is zero.
pub struct TtlClampResolver {
    inner: SharedResolver,
    max_ttl: u32,
}

impl TtlClampResolver {
    pub fn wrap(inner: SharedResolver, max_ttl: Duration) -> SharedResolver {
        let max_ttl = max_ttl.as_secs() as u32;
        if max_ttl == 0 {
            return inner;
        }
        Arc::new(TtlClampResolver { inner, max_ttl })
    }
}

#[async_trait]
impl Resolve for TtlClampResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        let mut response = self.inner.resolve(ctx, query).await?;
        if query.has_single_question(Some(RecordType::A)) {
            for record in &mut response.answers {
                if record.rtype() == RecordType::A {
                    record.ttl = record.ttl.min(self.max_ttl);
                }
            }
        }
        Ok(response)
    }
}
