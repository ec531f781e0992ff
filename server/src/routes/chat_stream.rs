//! Plain-text streaming endpoint.
//!
//! Every fragment is followed by `///` and the body ends with `/././`. Requests
//! here do not go through the admission gate.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use tiergate_common::{StreamRequest, CHAT_STREAM_FOOTER, CHAT_STREAM_TERMINATOR};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{client_address, relay};
use crate::engine::GenerationRequest;
use crate::error::Error;
use crate::state::AppState;
use crate::transcript::{spawn_record, TranscriptRecord};

/// POST /api/chat_stream
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<StreamRequest>,
) -> Response {
    let client = client_address(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    tracing::info!(client = %client, "Chat stream: {}", request.prompt);

    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        let generation =
            GenerationRequest::from_stream_request(state.session.engine.as_ref(), &request);
        let response = match relay(&state, generation, &tx, |fragment| {
            format!("{}{}", fragment, CHAT_STREAM_FOOTER)
        })
        .await
        {
            Ok(response) => {
                state.fail_fast().record_success();
                response
            }
            Err(Error::ClientDisconnected) => {
                tracing::info!(client = %client, "Chat stream client went away");
                return;
            }
            Err(e) => {
                tracing::error!(client = %client, "Chat stream failed: {}", e);
                state.fail_fast().record_failure();
                String::new()
            }
        };

        spawn_record(
            state.session.transcripts.clone(),
            TranscriptRecord::new(&client, &request.prompt, &response),
        );
        let _ = tx.send(CHAT_STREAM_TERMINATOR.to_string()).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}
