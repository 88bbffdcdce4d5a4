//! Completion handlers.

use axum::{extract::State, Json};

use crate::error::ServerError;
use crate::models::{ChatCompleteRequest, CompleteRequest, CompleteResponse};
use crate::state::AppState;

/// Handle `POST /complete`.
pub async fn handle_complete(
    State(state): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ServerError> {
    let tokens = state.server.complete_text(req).await?;
    Ok(Json(CompleteResponse::from_tokens(tokens)))
}

/// Handle `POST /chat/completions`.
pub async fn handle_chat_complete(
    State(state): State<AppState>,
    Json(req): Json<ChatCompleteRequest>,
) -> Result<Json<CompleteResponse>, ServerError> {
    if req.messages.is_empty() {
        return Err(ServerError::InvalidRequest("messages must not be empty".into()));
    }
    let tokens = state.server.chat_complete(req).await?;
    Ok(Json(CompleteResponse::from_tokens(tokens)))
}
