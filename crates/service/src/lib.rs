//! HTTP/SSE facade (C8) over [`agentcore::Orchestrator`].
//!
//! Thin adapter: validates the request, persists the user message through
//! the same `ChatStore` the orchestrator reads from, and streams the
//! orchestrator's output back as NDJSON. No conversation logic lives here
//! — that's the core crate's job.

pub mod config;

use std::sync::Arc;

use agentcore::chat::{ChatMessage, MessageContent};
use agentcore::mcp::ToolSelection;
use agentcore::store::{ChatStore, SharedChatStore};
use agentcore::Orchestrator;
use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedChatStore,
    pub orchestrator: Arc<Orchestrator>,
    pub default_model: String,
}

#[derive(Deserialize)]
struct TurnRequest {
    chat_id: Option<Uuid>,
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    enable_tools: Option<bool>,
    #[serde(default)]
    enabled_tools: Option<Vec<String>>,
}

/// Builds the router: a single streaming endpoint plus permissive CORS.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/turns", post(handle_turn))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Streams one assistant turn back as NDJSON: one JSON string per line
/// for text chunks, with a final `{"error":"..."}` line on failure.
async fn handle_turn(
    State(state): State<AppState>,
    Json(req): Json<TurnRequest>,
) -> Result<Response, (StatusCode, String)> {
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message must not be empty".into()));
    }

    let chat_id = req.chat_id.unwrap_or_else(Uuid::new_v4);
    let model = req.model.unwrap_or_else(|| state.default_model.clone());
    let selection = match req.enable_tools {
        Some(false) => ToolSelection::none(),
        _ => ToolSelection {
            enable_tools: true,
            enabled: req.enabled_tools.map(|v| v.into_iter().collect()),
        },
    };

    let user_message = ChatMessage::user(chat_id, MessageContent::Text(req.message));
    state.store.append(user_message).await.map_err(|e| {
        warn!(error = %e, "failed to persist user message");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let stream = state
        .orchestrator
        .clone()
        .stream_assistant_turn(chat_id, model, selection)
        .map(|line| Ok::<_, std::convert::Infallible>(format!("{}\n", frame_ndjson_line(&line))));

    let body = axum::body::Body::from_stream(stream);
    Ok(Response::builder()
        .header("Content-Type", "application/x-ndjson")
        .body(body)
        .expect("static response headers are always valid"))
}

/// The orchestrator's output sequence is plain text for ordinary chunks
/// and a pre-built JSON object for terminal error chunks
/// (`{"error":"..."}`). Frame both as one JSON object per line: pass an
/// already-JSON line through verbatim, otherwise wrap the text.
fn frame_ndjson_line(line: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) if value.is_object() => value.to_string(),
        _ => serde_json::json!({ "content": line }).to_string(),
    }
}
