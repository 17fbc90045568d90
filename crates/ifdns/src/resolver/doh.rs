use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use ifdns_proto::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::{QueryCtx, Resolve};

pub const DNS_MESSAGE_MEDIA_TYPE: &str = "application/dns-message";

/// DNS-over-HTTPS client: wire-format messages POSTed both ways.
pub struct DohResolver {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl DohResolver {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build an HTTP client")?;
        Ok(DohResolver {
            name: name.into(),
            url: url.into(),
            http,
        })
    }

    async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
        let request = query.to_wire().context("failed to encode the query")?;
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE_MEDIA_TYPE)
            .header(ACCEPT, DNS_MESSAGE_MEDIA_TYPE)
            .body(request)
            .send()
            .await
            .with_context(|| format!("error while sending a request to {}", self.url))?;

        anyhow::ensure!(
            response.status() == reqwest::StatusCode::OK,
            "unexpected status code: {}",
            response.status()
        );

        let body = response.bytes().await.context("error while reading the response body")?;
        Message::from_wire(&body).context("failed to decode the response")
    }
}

#[async_trait]
impl Resolve for DohResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("doh client '{}': query cancelled", self.name),
            res = self.exchange(query) => res.with_context(|| format!("doh client '{}'", self.name)),
        }
    }
}
