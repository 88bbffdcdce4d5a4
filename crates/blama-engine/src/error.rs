//! Error types shared across the blama stack.

use thiserror::Error;

/// Top-level error type for all engine operations.
///
/// Variants map the error policy of the stack: configuration, phase, and
/// resource-limit errors surface to the caller synchronously; backend
/// failures surface without retry (the KV cache is then suspect and the
/// surrounding session should be discarded); data errors on auxiliary
/// resources are usually degraded to warnings by the caller.
#[derive(Debug, Error)]
pub enum BlamaError {
    /// Malformed parameters: bad sampler config, invalid template, bad env.
    #[error("{0}")]
    Config(String),

    /// Operation invoked in the wrong session phase or on a busy instance.
    #[error("{0}")]
    Phase(String),

    /// Prompt or context budget exceeded.
    #[error("{0}")]
    ResourceLimit(String),

    /// The backend returned non-success from decode/encode/state IO.
    #[error("backend failure: {0}")]
    Backend(String),

    /// Malformed GGUF data, missing or mismatched tensors.
    #[error("data error: {0}")]
    Data(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BlamaError>;
