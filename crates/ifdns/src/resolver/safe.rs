use std::sync::Arc;

use async_trait::async_trait;
use ifdns_proto::{Message, Rcode};

use super::{QueryCtx, Resolve, SharedResolver};

/// Boundary decorator: turns pipeline errors into REFUSED replies so the wire
/// protocol stays well-formed. The error itself is recorded before being
/// swallowed.
pub struct SafeResolver {
    inner: SharedResolver,
}

impl SafeResolver {
    pub fn wrap(inner: SharedResolver) -> SharedResolver {
        Arc::new(SafeResolver { inner })
    }
}

#[async_trait]
impl Resolve for SafeResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        match self.inner.resolve(ctx, query).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(id = query.header.id, "refusing failed query: {e:#}");
                Ok(Message::reply_to(query, Rcode::Refused))
            }
        }
    }
}
