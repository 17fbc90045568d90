use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ifdns_proto::{Message, Rcode};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::resolver::{QueryCtx, SharedResolver};

const MAX_UDP_QUERY: usize = 4096;
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// DNS-over-UDP front door: every inbound datagram becomes an independent
/// handler task carrying the client address in its context.
pub struct DnsUdpServer {
    socket: Arc<UdpSocket>,
    resolver: SharedResolver,
}

impl DnsUdpServer {
    pub async fn bind(addr: &str, resolver: SharedResolver) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        Ok(DnsUdpServer {
            socket: Arc::new(socket),
            resolver,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("UDP socket has no local addr")
    }

    pub async fn serve(self, cancel: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "DNS server starting");
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut buf = vec![0u8; MAX_UDP_QUERY];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!("failed to receive a datagram: {e:#}");
                            continue;
                        }
                    };
                    let packet = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let resolver = self.resolver.clone();
                    let ctx = QueryCtx::new(cancel.child_token(), peer.to_string());
                    handlers.spawn(async move {
                        handle_query(socket, resolver, ctx, packet, peer).await;
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        tracing::info!("shutting down DNS server...");
        let drain = async {
            while handlers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_BUDGET, drain).await.is_err() {
            tracing::warn!(remaining = handlers.len(), "drain budget exceeded, aborting in-flight queries");
            handlers.abort_all();
        }
        Ok(())
    }
}

async fn handle_query(
    socket: Arc<UdpSocket>,
    resolver: SharedResolver,
    ctx: QueryCtx,
    packet: Vec<u8>,
    peer: SocketAddr,
) {
    let query = match Message::from_wire(&packet) {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!(%peer, "dropping a malformed query: {e:#}");
            // The header id is all that is needed to refuse politely.
            if packet.len() >= 2 {
                let mut refused = Message::new();
                refused.header.id = u16::from_be_bytes([packet[0], packet[1]]);
                refused.header.response = true;
                refused.header.rcode = Rcode::Refused;
                send_reply(&socket, &refused, peer).await;
            }
            return;
        }
    };

    let response = match resolver.resolve(&ctx, &query).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to handle request: {e:#}");
            Message::reply_to(&query, Rcode::Refused)
        }
    };
    send_reply(&socket, &response, peer).await;
}

async fn send_reply(socket: &UdpSocket, reply: &Message, peer: SocketAddr) {
    match reply.to_wire() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                tracing::warn!(%peer, "failed to send a reply: {e:#}");
            }
        }
        Err(e) => tracing::error!("failed to encode a reply: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use ifdns_proto::RecordType;

    use super::*;
    use crate::resolver::testing::{a_response, ScriptedResolver};

    async fn start_server(resolver: SharedResolver) -> (SocketAddr, CancellationToken) {
        let server = DnsUdpServer::bind("127.0.0.1:0", resolver).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (addr, cancel)
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> Message {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(request, addr).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        Message::from_wire(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn serves_a_resolved_answer() {
        let resolver = Arc::new(ScriptedResolver::answering(a_response(
            "udp.example.com",
            60,
            &[std::net::Ipv4Addr::new(192, 0, 2, 1)],
        )));
        let (addr, cancel) = start_server(resolver).await;

        let query = Message::query(77, "udp.example.com", RecordType::A);
        let reply = exchange(addr, &query.to_wire().unwrap()).await;
        assert_eq!(reply.header.id, 77);
        assert_eq!(reply.answers.len(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn refuses_when_the_pipeline_fails() {
        let (addr, cancel) = start_server(Arc::new(ScriptedResolver::failing())).await;

        let query = Message::query(78, "fail.example.com", RecordType::A);
        let reply = exchange(addr, &query.to_wire().unwrap()).await;
        assert_eq!(reply.header.id, 78);
        assert_eq!(reply.header.rcode, Rcode::Refused);

        cancel.cancel();
    }

    #[tokio::test]
    async fn refuses_malformed_queries_with_the_raw_id() {
        let (addr, cancel) = start_server(Arc::new(ScriptedResolver::failing())).await;

        // A bare header claiming one question that never follows.
        let mut garbage = vec![0u8; 12];
        garbage[0] = 0xAB;
        garbage[1] = 0xCD;
        garbage[5] = 1;
        let reply = exchange(addr, &garbage).await;
        assert_eq!(reply.header.id, 0xABCD);
        assert_eq!(reply.header.rcode, Rcode::Refused);

        cancel.cancel();
    }
}
