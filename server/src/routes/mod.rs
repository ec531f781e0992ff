//! HTTP and WebSocket surface.

pub mod chat_stream;
pub mod completions;
pub mod health;
pub mod queue;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::engine::GenerationRequest;
use crate::error::{Error, Result};
use crate::logging::request_logger;
use crate::state::AppState;

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/chat_now", get(queue::chat_now))
        .route("/api/chat_stream", post(chat_stream::chat_stream))
        .route("/api/completions", post(completions::completions))
        .with_state(state)
        .merge(health::router())
        .layer(middleware::from_fn(request_logger))
}

/// Address recorded for a client: the proxy's `X-Real-IP` when present,
/// otherwise the peer address.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Run one generation outside the admission gate, handing every non-empty
/// fragment to `tx` after passing it through `wrap`.
///
/// Returns the full response text. Fails with `Error::ClientDisconnected`
/// once the receiving side is gone.
pub(crate) async fn relay<T>(
    state: &AppState,
    generation: GenerationRequest,
    tx: &mpsc::Sender<T>,
    wrap: impl Fn(&str) -> T,
) -> Result<String> {
    let mut stream = state.session.engine.generate(generation).await?;

    let mut response = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        if fragment.is_empty() {
            continue;
        }
        tx.send(wrap(&fragment))
            .await
            .map_err(|_| Error::ClientDisconnected)?;
        response.push_str(&fragment);
    }

    if response.is_empty() {
        return Err(Error::EngineFailure(
            "engine finished without producing output".to_string(),
        ));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_address_prefers_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(client_address(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_client_address_falls_back_to_peer() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(client_address(&HeaderMap::new(), Some(peer)), "10.0.0.1");
        assert_eq!(client_address(&HeaderMap::new(), None), "unknown");
    }
}
