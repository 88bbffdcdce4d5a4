//! # blama-infer
//!
//! The serving core of the blama stack: model and vocabulary wrappers over
//! the opaque backend, the composable sampler chain with its grammar
//! constraint, the per-conversation session state machine (prefill, decode,
//! context shifting, state IO), chat template formatting, streaming stop
//! sequence detection, and the logit comparer used by verification.
//!
//! Everything here is backend-agnostic: the tensor runtime is reached only
//! through the `blama-engine` traits.

pub mod antiprompt;
pub mod chat;
pub mod control_vector;
pub mod embedding;
pub mod instance;
pub mod logit_compare;
pub mod lora;
pub mod model;
pub mod sampler;
pub mod session;
pub mod vocab;

pub use antiprompt::{AntipromptFinder, AntipromptManager};
pub use chat::{ChatFormat, ChatParams};
pub use control_vector::{ControlVector, ControlVectorLoadInfo};
pub use embedding::{EmbeddingInstance, EmbeddingInstanceParams};
pub use instance::{Instance, InstanceParams};
pub use logit_compare::{ComparisonMetrics, LogitComparer, MetricsAggregator};
pub use lora::LoraAdapter;
pub use model::{Model, ModelParams};
pub use sampler::{
    MirostatParams, RepetitionPenaltyParams, Sampler, SamplerParams, SamplingKind,
    XtcSamplerParams,
};
pub use session::{CompleteParams, Session, SessionParams};
pub use vocab::Vocab;
