mod cache;
mod clamp;
mod doh;
mod mdns;
mod multi;
mod safe;
mod single_flight;
mod udp;

pub use cache::{spawn_cache_janitor, CachedResolver, DnsCache};
pub use clamp::TtlClampResolver;
pub use doh::{DohResolver, DNS_MESSAGE_MEDIA_TYPE};
pub use mdns::MdnsResolver;
pub use multi::{resolver_for_endpoint, MultiResolver, Provider};
pub use safe::SafeResolver;
pub use single_flight::SingleFlightResolver;
pub use udp::UdpResolver;

use std::sync::Arc;

use async_trait::async_trait;
use ifdns_proto::{Message, Rcode};
use tokio_util::sync::CancellationToken;

/// Per-query context carried through the resolver chain: cancellation plus
/// the client address the event streams report.
#[derive(Debug, Clone, Default)]
pub struct QueryCtx {
    pub cancel: CancellationToken,
    pub client_addr: String,
}

impl QueryCtx {
    pub fn new(cancel: CancellationToken, client_addr: impl Into<String>) -> Self {
        QueryCtx {
            cancel,
            client_addr: client_addr.into(),
        }
    }

    /// A context whose cancellation follows this one but can also be
    /// triggered on its own, e.g. to stop the losers of a race.
    pub fn child(&self) -> QueryCtx {
        QueryCtx {
            cancel: self.cancel.child_token(),
            client_addr: self.client_addr.clone(),
        }
    }
}

/// The single capability every leaf resolver and decorator implements.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message>;
}

pub type SharedResolver = Arc<dyn Resolve>;

/// A response that settles a race: a NOERROR reply with at least one answer.
pub fn is_succeeded(resp: &Message) -> bool {
    resp.header.response && resp.header.rcode == Rcode::NoError && !resp.answers.is_empty()
}
