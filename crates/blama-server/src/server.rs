//! Router setup and the HTTP entry point.

use std::net::SocketAddr;

use axum::{
    http::{Method, StatusCode},
    routing::post,
    Router,
};
use tower_http::cors::CorsLayer;

use crate::{handlers, state::AppState};

/// Build the API router. The protocol is POST-only: a non-POST request is a
/// 400 regardless of path, an unknown path is a 404.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/complete",
            post(handlers::complete::handle_complete).fallback(wrong_method),
        )
        .route(
            "/chat/completions",
            post(handlers::complete::handle_chat_complete).fallback(wrong_method),
        )
        .route(
            "/verify_completion",
            post(handlers::verify::handle_verify).fallback(wrong_method),
        )
        .route(
            "/chat/verify_completion",
            post(handlers::verify::handle_chat_verify).fallback(wrong_method),
        )
        .fallback(unknown_route)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn wrong_method() -> StatusCode {
    StatusCode::BAD_REQUEST
}

async fn unknown_route(method: Method) -> StatusCode {
    if method == Method::POST {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    }
}

/// Serve until interrupted.
pub async fn run_server(
    state: AppState,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received, draining connections");
}
