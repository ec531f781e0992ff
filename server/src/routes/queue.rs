use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use tiergate_common::QueueDepth;

use crate::state::AppState;

/// GET /api/chat_now - sessions holding a slot and open streaming connections.
pub async fn chat_now(State(state): State<Arc<AppState>>) -> Json<QueueDepth> {
    Json(state.queue_depth())
}
