mod http;
mod udp;

pub use http::{doh_router, serve_http};
pub use udp::DnsUdpServer;
