//! # blama-engine
//!
//! The "narrow waist" of the blama stack. Defines the core token types, the
//! top-level error enum, and the backend trait contract that all other crates
//! depend on. The GGUF tensor runtime behind the traits is an opaque
//! collaborator: implementations can swap a native runtime for the
//! deterministic reference backend without changing application code.
//!
//! ## Design Notes
//!
//! ### Token Type
//! `Token` is aliased as `i32` for runtime compatibility, though token IDs are
//! logically non-negative. `TOKEN_INVALID` (-1) is the shared sentinel for
//! "no token" at API boundaries; internal state prefers `Option<Token>`.
//!
//! ### Ownership
//! A model is shared immutably (`Arc<dyn ModelBackend>`); a decode context is
//! an exclusive, move-only resource (`Box<dyn ContextBackend>`). Contexts are
//! never cloned.

pub mod backend;
pub mod error;
pub mod init;
pub mod token;

pub use backend::{
    ContextBackend, ContextParams, LoadProgressFn, ModelBackend, ModelLoadParams, ModelLoader,
    VocabBackend,
};
pub use error::{BlamaError, Result};
pub use init::{bridge_backend_log, init_library, LogLevel};
pub use token::{ChatMsg, Token, TokenData, TokenDataVector, TokenPrediction, TOKEN_INVALID};
