use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use ifdns_proto::{Message, RData, Rcode, Record, RecordType};
use tokio::net::UdpSocket;

use super::{QueryCtx, Resolve};

const MAX_MDNS_RESPONSE: usize = 4096;

/// Multicast DNS client for `.local` names. Sends a one-shot query to the
/// multicast group and synthesises an A response from the first answer.
pub struct MdnsResolver {
    name: String,
    group: String,
    timeout: Duration,
}

impl MdnsResolver {
    pub fn new(name: impl Into<String>, group: impl Into<String>, timeout: Duration) -> Self {
        MdnsResolver {
            name: name.into(),
            group: group.into(),
            timeout,
        }
    }

    async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
        let question = query
            .first_question()
            .context("mdns supports single-question queries only")?;
        let qname = question.name.clone();

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("unable to bind a socket")?;

        let probe = Message::query(rand::random(), qname.clone(), RecordType::A);
        socket
            .send_to(&probe.to_wire().context("failed to encode the query")?, &self.group)
            .await
            .with_context(|| format!("error while sending a query to {}", self.group))?;

        let mut buf = vec![0u8; MAX_MDNS_RESPONSE];
        loop {
            let (len, _) = socket
                .recv_from(&mut buf)
                .await
                .context("error while reading a response")?;
            let Ok(response) = Message::from_wire(&buf[..len]) else {
                continue;
            };
            // mDNS responders answer with id 0; match on the name instead.
            let answer = response
                .answers
                .iter()
                .find(|record| record.rtype() == RecordType::A && record.name.eq_ignore_ascii_case(&qname));
            if let Some(answer) = answer {
                let RData::A(addr) = answer.data else { continue };
                let mut reply = Message::reply_to(query, Rcode::NoError);
                reply.answers.push(Record::new(qname, answer.ttl, RData::A(addr)));
                return Ok(reply);
            }
        }
    }
}

#[async_trait]
impl Resolve for MdnsResolver {
    async fn resolve(&self, ctx: &QueryCtx, query: &Message) -> anyhow::Result<Message> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("mdns client '{}': query cancelled", self.name),
            res = tokio::time::timeout(self.timeout, self.exchange(query)) => res
                .map_err(|_| anyhow::anyhow!("mdns client '{}': query timed out", self.name))?
                .with_context(|| format!("mdns client '{}'", self.name)),
        }
    }
}
