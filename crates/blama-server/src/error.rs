//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use blama_engine::BlamaError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Engine(#[from] BlamaError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ServerError::Engine(BlamaError::Config(_))
            | ServerError::Engine(BlamaError::Phase(_))
            | ServerError::Engine(BlamaError::ResourceLimit(_))
            | ServerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            ServerError::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}
