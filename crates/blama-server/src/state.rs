//! Application state shared across handlers.

use std::sync::Arc;

use crate::facade::Server;

/// Router state: the façade owning the inference worker.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
}
