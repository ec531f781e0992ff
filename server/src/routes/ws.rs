//! WebSocket handler for streaming sessions.
//!
//! The client opens the socket and sends one text message holding a
//! `StreamRequest`. The server answers with `ServerFrame`s until `done` and
//! then closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tiergate_common::{ServerFrame, StreamRequest};
use tokio::time::{timeout, Duration};

use super::client_address;
use crate::error::{Error, Result};
use crate::session::{FrameSink, StreamingSession};
use crate::state::AppState;

/// How long a client may take to send its request after connecting.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let client = client_address(&headers, Some(addr));
    tracing::info!("Session connection from {}", client);
    ws.on_upgrade(move |socket| handle_session(socket, state, client))
}

/// Handle one client connection from request to close.
async fn handle_session(socket: WebSocket, state: Arc<AppState>, client: String) {
    let _connection = state.track_connection();
    let (ws_tx, mut ws_rx) = socket.split();
    let mut sink = WsFrameSink { tx: ws_tx };

    let request = match timeout(REQUEST_TIMEOUT, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<StreamRequest>(&text) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to parse request from {}: {}", client, e);
                reject(&mut sink, Error::InvalidRequest(e.to_string())).await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!("Expected text message for request from {}", client);
            reject(
                &mut sink,
                Error::InvalidRequest("expected a text message".to_string()),
            )
            .await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("WebSocket error before request from {}: {}", client, e);
            return;
        }
        Ok(None) => {
            tracing::info!("Connection closed before request from {}", client);
            return;
        }
        Err(_) => {
            tracing::warn!("Request timeout from {}", client);
            reject(
                &mut sink,
                Error::InvalidRequest("request timeout".to_string()),
            )
            .await;
            return;
        }
    };

    let session = StreamingSession::new(state.session.clone(), client.clone());
    let id = session.id();
    let outcome = session.run(request, &mut sink, wait_for_close(ws_rx)).await;

    tracing::info!(session = %id, client = %client, ?outcome, "Session finished");
}

/// Send an error frame followed by `done` and close.
async fn reject(sink: &mut WsFrameSink, error: Error) {
    let _ = sink.send(ServerFrame::error(error.to_string())).await;
    let _ = sink.send(ServerFrame::Done).await;
    sink.close().await;
}

/// Resolves once the client closes the socket or the connection breaks.
async fn wait_for_close(mut rx: SplitStream<WebSocket>) {
    while let Some(result) = rx.next().await {
        match result {
            Ok(Message::Close(_)) | Err(_) => return,
            // Nothing else is expected after the request.
            Ok(_) => {}
        }
    }
}

/// Sends frames as JSON text messages.
struct WsFrameSink {
    tx: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<()> {
        let json = serde_json::to_string(&frame).map_err(|e| {
            tracing::error!("Failed to encode frame: {}", e);
            Error::ClientDisconnected
        })?;
        self.tx
            .send(Message::Text(json))
            .await
            .map_err(|_| Error::ClientDisconnected)
    }

    async fn close(&mut self) {
        let _ = self.tx.close().await;
    }
}
