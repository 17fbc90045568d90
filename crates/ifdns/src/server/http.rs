use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use ifdns_proto::Message;
use tokio_util::sync::CancellationToken;

use crate::resolver::{QueryCtx, SharedResolver, DNS_MESSAGE_MEDIA_TYPE};

struct DohState {
    resolver: SharedResolver,
    cancel: CancellationToken,
}

pub fn doh_router(resolver: SharedResolver, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/dns-query", post(handle_dns_query))
        .with_state(Arc::new(DohState { resolver, cancel }))
}

/// Serves `POST /dns-query` until `cancel` fires.
pub async fn serve_http(addr: String, resolver: SharedResolver, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    tracing::info!(%addr, "HTTP server starting");
    let router = doh_router(resolver, cancel.clone());
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .context("HTTP server failed")
}

async fn handle_dns_query(
    State(state): State<Arc<DohState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let media_type = |name| headers.get(name).and_then(|v| v.to_str().ok());
    if media_type(header::CONTENT_TYPE) != Some(DNS_MESSAGE_MEDIA_TYPE)
        || media_type(header::ACCEPT) != Some(DNS_MESSAGE_MEDIA_TYPE)
    {
        return (StatusCode::BAD_REQUEST, "unexpected request format").into_response();
    }

    let query = match Message::from_wire(&body) {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!(%peer, "malformed DoH query: {e:#}");
            return (StatusCode::BAD_REQUEST, "malformed DNS message").into_response();
        }
    };

    let ctx = QueryCtx::new(state.cancel.child_token(), peer.to_string());
    let response = match state.resolver.resolve(&ctx, &query).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to handle a DoH request: {e:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match response.to_wire() {
        Ok(bytes) => ([(header::CONTENT_TYPE, DNS_MESSAGE_MEDIA_TYPE)], bytes).into_response(),
        Err(e) => {
            tracing::error!("failed to encode a DoH response: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
