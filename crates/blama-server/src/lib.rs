//! # blama-server
//!
//! HTTP façade over the blama inference core: four POST endpoints for text
//! completion, chat completion, and their verification counterparts.
//!
//! All inference for a server runs on one dedicated worker thread, matching
//! the single-session-per-instance model; the transport runs on a
//! multi-threaded tokio runtime and awaits per-job completions.

pub mod config;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod models;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use facade::Server;
pub use server::{create_router, run_server};
pub use state::AppState;
