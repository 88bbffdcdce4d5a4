//! The opaque backend contract.
//!
//! These traits fix the boundary between the serving layers and the GGUF
//! tensor runtime. The runtime owns tokenization, the forward pass, the KV
//! cache, and context state serialization; everything above it (sessions,
//! samplers, comparers, the server) is runtime-agnostic.
//!
//! Position bookkeeping convention: the context holds a single sequence of
//! tokens at positions `[0, n)`. `decode` appends at the tail; the `kv_*`
//! operations edit position ranges `[start, end)` the way a rolling context
//! shift or a group-attention self-extend requires.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::token::Token;

/// Parameters for loading a model through a [`ModelLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLoadParams {
    /// Prefer GPU device placement; `false` forces CPU-only.
    pub gpu: bool,
    /// Load the vocabulary only, skipping tensor data.
    pub vocab_only: bool,
}

impl Default for ModelLoadParams {
    fn default() -> Self {
        ModelLoadParams {
            gpu: true,
            vocab_only: false,
        }
    }
}

/// Parameters for creating a decode context on a model.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// Context length; 0 means the model's trained maximum.
    pub n_ctx: u32,
    /// Logical batch size for prompt processing.
    pub n_batch: u32,
    /// Physical micro-batch size.
    pub n_ubatch: u32,
    pub flash_attn: bool,
    /// Create the context with embedding extraction enabled.
    pub embeddings: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            n_ctx: 0,
            n_batch: 2048,
            n_ubatch: 512,
            flash_attn: false,
            embeddings: false,
        }
    }
}

/// Model load progress callback; invoked with `progress` in `[0, 1]`.
/// Loading always continues regardless of observer behavior.
pub type LoadProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Entry point of a backend: turns a GGUF path into a shared model handle.
pub trait ModelLoader: Send + Sync {
    fn load_model(
        &self,
        path: &Path,
        params: ModelLoadParams,
        progress: Option<LoadProgressFn<'_>>,
    ) -> Result<Arc<dyn ModelBackend>>;
}

/// A loaded model: immutable, shared across any number of contexts.
pub trait ModelBackend: Send + Sync {
    /// Context length the model was trained with (0 for vocab-only loads).
    fn train_ctx_length(&self) -> u32;
    fn has_encoder(&self) -> bool;
    fn has_decoder(&self) -> bool;
    fn n_layer(&self) -> u32;
    fn n_embd(&self) -> u32;

    /// String metadata lookup (e.g. `tokenizer.chat_template`).
    fn meta_value(&self, key: &str) -> Option<String>;

    fn vocab(&self) -> &dyn VocabBackend;

    /// Create an exclusive decode context bound to this model.
    fn new_context(&self, params: ContextParams) -> Result<Box<dyn ContextBackend>>;

    /// Load a LoRA adapter for this model, returning an opaque handle.
    fn load_lora(&self, path: &Path) -> Result<u64>;

    /// Identity used to check that adapters and contexts belong together.
    fn model_id(&self) -> u64;
}

/// The model's vocabulary and special-token table.
pub trait VocabBackend: Send + Sync {
    fn n_tokens(&self) -> u32;
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<Token>;
    fn token_to_piece(&self, token: Token, special: bool) -> String;
    /// End-of-generation test (EOS, EOT and friends).
    fn is_eog(&self, token: Token) -> bool;
    /// Whether the tokenizer prepends BOS on `add_special`.
    fn should_add_bos(&self) -> bool;

    /// Special tokens; `TOKEN_INVALID` when the vocabulary lacks one.
    fn bos(&self) -> Token;
    fn eos(&self) -> Token;
    fn fim_pre(&self) -> Token;
    fn fim_suf(&self) -> Token;
    fn fim_mid(&self) -> Token;
    /// Decoder-start token of encoder-decoder models; `TOKEN_INVALID` makes
    /// callers fall back to BOS.
    fn decoder_start(&self) -> Token;
}

/// An exclusive decode context: KV cache, logits, state IO.
///
/// Move-only by construction (`Box<dyn ContextBackend>`); never cloned.
pub trait ContextBackend: Send {
    fn n_ctx(&self) -> u32;
    fn n_batch(&self) -> u32;

    /// Append `tokens` at the current sequence tail and run the forward
    /// pass. Refreshes the logits of the batch's last token.
    fn decode(&mut self, tokens: &[Token]) -> Result<()>;

    /// Run the encoder half (encoder-decoder and encoder-only models).
    fn encode(&mut self, tokens: &[Token]) -> Result<()>;

    /// Logits of the last decoded position; length equals vocabulary size.
    fn logits(&self) -> &[f32];

    /// Remove positions `[start, end)` from the KV sequence.
    fn kv_remove(&mut self, start: u32, end: u32);
    /// Shift positions `[start, end)` by `delta`.
    fn kv_shift(&mut self, start: u32, end: u32, delta: i32);
    /// Integer-divide positions `[start, end)` by `divisor`.
    fn kv_divide(&mut self, start: u32, end: u32, divisor: u32);
    fn kv_clear(&mut self);

    /// Serialize the full context state (KV cache included) verbatim.
    fn state_data(&self) -> Result<Vec<u8>>;
    /// Restore state produced by [`ContextBackend::state_data`] on a context
    /// with identical model and parameters. Returns the restored token count.
    fn set_state_data(&mut self, data: &[u8]) -> Result<u32>;

    /// Whether the context pools embeddings over the sequence.
    fn pooled_embeddings(&self) -> bool;
    /// Pooled sequence embedding (pooling contexts only).
    fn embeddings_seq(&self) -> Option<Vec<f32>>;
    /// Per-token embedding at batch index `i` (non-pooling contexts only).
    fn embeddings_ith(&self, i: usize) -> Option<Vec<f32>>;

    fn set_lora(&mut self, adapter: u64, scale: f32) -> Result<()>;
    fn clear_lora(&mut self);

    /// Install per-layer steering vectors for layers
    /// `[layer_start, layer_end]`; `data` is `n_embd * n_layers` floats with
    /// layer 1 stored at offset 0.
    fn apply_control_vector(
        &mut self,
        data: &[f32],
        n_embd: i32,
        layer_start: u32,
        layer_end: u32,
    ) -> Result<()>;

    /// Reset backend-side perf counters; a no-op for backends without them.
    fn perf_reset(&mut self) {}
}
