use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use ifdns_proto::Message;
use tokio::net::UdpSocket;

use super::{QueryCtx, Resolve};

const MAX_UDP_RESPONSE: usize = 4096;

/// Plain DNS-over-UDP client: one exchange per call with a wall-clock timeout.
pub struct UdpResolver {
    name: String,
    address: String,
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(name: impl Into<String>, address: impl Into<String>, timeout: Duration) -> Self {
        UdpResolver {
            name: name.into(),
            address: address.into(),
            timeout,
        }
    }

    async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("unable to bind a socket")?;
        socket
            .connect(&self.address)
            .await
            .with_context(|| format!("error while connecting to {}", self.address))?;

        let request = query.to_wire().context("failed to encode the query")?;
        socket.send(&request).await.context("error while sending the query")?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let len = socket.recv(&mut buf).await.context("error while reading the response")?;
            let response = Message::from_wire(&buf[..len]).context("failed to decode the response")?;
            // A stray datagram from an earlier exchange on a reused port.
            if response.header.id == query.header.id {
                return Ok(response);
            }
        }
    }
}

#[async_trait]
impl Resolve for UdpResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("udp client '{}': query cancelled", self.name),
            res = tokio::time::timeout(self.timeout, self.exchange(query)) => res
                .map_err(|_| anyhow::anyhow!("udp client '{}': query to {} timed out", self.name, self.address))?
                .with_context(|| format!("udp client '{}'", self.name)),
        }
    }
}
