//! Verification handlers: score one backend's completion on this backend.

use axum::{extract::State, Json};

use crate::error::ServerError;
use crate::models::{ChatVerifyRequest, VerifyRequest, VerifyResponse};
use crate::state::AppState;

/// Handle `POST /verify_completion`.
pub async fn handle_verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ServerError> {
    let result = state.server.verify(req.request, req.response).await?;
    Ok(Json(VerifyResponse { result }))
}

/// Handle `POST /chat/verify_completion`.
pub async fn handle_chat_verify(
    State(state): State<AppState>,
    Json(req): Json<ChatVerifyRequest>,
) -> Result<Json<VerifyResponse>, ServerError> {
    let result = state.server.chat_verify(req.request, req.response).await?;
    Ok(Json(VerifyResponse { result }))
}
