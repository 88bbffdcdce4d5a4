//! A decode context bound to a model, hosting at most one session.

use std::sync::Arc;

use blama_engine::{BlamaError, ContextBackend, ContextParams, Result, TOKEN_INVALID};

use crate::control_vector::ControlVector;
use crate::lora::LoraAdapter;
use crate::model::Model;
use crate::sampler::{Sampler, SamplerParams};
use crate::session::{Session, SessionParams};

/// Context construction parameters.
#[derive(Debug, Clone)]
pub struct InstanceParams {
    /// Context size; 0 means the model's maximum.
    pub ctx_size: u32,
    /// Logical batch size for prompt processing.
    pub batch_size: u32,
    /// Physical batch size.
    pub ubatch_size: u32,
    pub flash_attn: bool,
    /// BNF-styled grammar constraining generation.
    pub grammar: String,
}

impl Default for InstanceParams {
    fn default() -> Self {
        InstanceParams {
            ctx_size: 0,
            batch_size: 2048,
            ubatch_size: 512,
            flash_attn: false,
            grammar: String::new(),
        }
    }
}

/// Owns the decode context and the sampler. A session borrows both for its
/// lifetime, so the borrow checker enforces the one-live-session invariant.
pub struct Instance {
    model: Arc<Model>,
    sampler: Sampler,
    ctx: Box<dyn ContextBackend>,
}

impl Instance {
    pub fn new(model: Arc<Model>, params: InstanceParams) -> Result<Self> {
        let sampler = Sampler::new(
            &model,
            SamplerParams {
                grammar: params.grammar.clone(),
                ..SamplerParams::default()
            },
        )?;

        let ctx = model.backend().new_context(ContextParams {
            n_ctx: params.ctx_size,
            n_batch: params.batch_size,
            n_ubatch: params.ubatch_size,
            flash_attn: params.flash_attn,
            embeddings: false,
        })?;

        let ctx_len = ctx.n_ctx();
        let ctx_train = model.train_ctx_length();
        if ctx_len > ctx_train {
            tracing::warn!(
                "instance requested context length {ctx_len} is greater than the model's \
                 training context length {ctx_train}"
            );
        }

        Ok(Instance {
            model,
            sampler,
            ctx,
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Attach a LoRA adapter. The adapter must have been loaded for this
    /// instance's model.
    pub fn add_lora(&mut self, lora: &LoraAdapter, scale: f32) -> Result<()> {
        if lora.model_id() != self.model.backend().model_id() {
            return Err(BlamaError::Config(
                "lora adapter model does not match the instance model".into(),
            ));
        }
        self.ctx.set_lora(lora.handle(), scale)
    }

    pub fn clear_lora_state(&mut self) {
        self.ctx.clear_lora();
    }

    /// Propagate loaded steering vectors to the backend.
    pub fn add_control_vector(&mut self, cv: &ControlVector) -> Result<()> {
        self.ctx
            .apply_control_vector(&cv.data, cv.n_embd, cv.layer_start, cv.layer_end)
            .map_err(|e| BlamaError::Backend(format!("failed to apply control vectors: {e}")))
    }

    /// Minimal forward pass to prime caches. Leaves the KV cache empty.
    pub fn warmup(&mut self) -> Result<()> {
        tracing::info!("running warmup");
        let vocab = self.model.vocab();

        let mut tmp = Vec::new();
        if vocab.bos() != TOKEN_INVALID {
            tmp.push(vocab.bos());
        }
        if vocab.eos() != TOKEN_INVALID {
            tmp.push(vocab.eos());
        }
        if tmp.is_empty() {
            tmp.push(0);
        }

        if self.model.has_encoder() {
            self.ctx.encode(&tmp)?;
            tmp = vec![vocab.decoder_start_token()];
        }
        self.ctx.decode(&tmp)?;
        self.ctx.kv_clear();
        self.ctx.perf_reset();
        Ok(())
    }

    /// Replace the sampler, discarding its state. Usable between sessions;
    /// an active session exposes its own `reset_sampler`.
    pub fn reset_sampler(&mut self, params: SamplerParams) -> Result<()> {
        self.sampler = Sampler::new(&self.model, params)?;
        Ok(())
    }

    /// Begin the instance's sole session. The returned session borrows the
    /// instance exclusively; it ends when the session is dropped.
    pub fn start_session(&mut self, params: SessionParams) -> Result<Session<'_>> {
        Session::start(self.model.clone(), &mut self.ctx, &mut self.sampler, params)
    }
}
