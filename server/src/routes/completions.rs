//! Server-Sent Events completions endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tiergate_common::CompletionsRequest;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{client_address, relay};
use crate::engine::GenerationRequest;
use crate::error::{Error, Result};
use crate::state::AppState;

#[derive(Serialize)]
struct CompletionChunk<'a> {
    response: &'a str,
}

/// POST /api/completions
///
/// Streams `{"response": ...}` events and finishes with `[DONE]`. A failed
/// generation ends with a single event carrying the error text instead.
pub async fn completions(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<CompletionsRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let client = client_address(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let (history, prompt) = request
        .split_prompt()
        .ok_or_else(|| Error::InvalidRequest("messages must not be empty".to_string()))?;

    tracing::info!(client = %client, "Completions: {}", prompt);

    let generation = GenerationRequest {
        prompt: prompt.to_string(),
        history: state.session.engine.initialize_history(history),
        max_length: request.max_tokens,
        top_p: request.top_p,
        temperature: request.temperature,
        use_retrieval: request.use_retrieval,
    };

    let (tx, rx) = mpsc::channel::<Event>(32);
    tokio::spawn(async move {
        match relay(&state, generation, &tx, response_event).await {
            Ok(_) => {
                state.fail_fast().record_success();
                let _ = tx.send(Event::default().data("[DONE]")).await;
            }
            Err(Error::ClientDisconnected) => {
                tracing::info!(client = %client, "Completions client went away");
            }
            Err(e) => {
                tracing::error!(client = %client, "Completions failed: {}", e);
                state.fail_fast().record_failure();
                let _ = tx.send(response_event(&e.to_string())).await;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default()))
}

fn response_event(text: &str) -> Event {
    Event::default()
        .json_data(CompletionChunk { response: text })
        .unwrap_or_else(|_| Event::default().data(text))
}
