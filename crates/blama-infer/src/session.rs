//! The per-conversation state machine.
//!
//! A session drives prefill and decode over its instance's context, keeps
//! the KV occupancy within the context budget (rolling shift or
//! group-attention self-extend), streams predictions, and snapshots or
//! restores full context state.
//!
//! The pending-token mechanic: `get_token` yields a token to the caller
//! *before* decoding it into context. The decode happens lazily on the next
//! state-visible operation, so a token that was streamed out but never
//! followed up on (an aborted stream) is never decoded.

use std::sync::Arc;

use blama_engine::{
    BlamaError, ContextBackend, Result, Token, TokenPrediction, TOKEN_INVALID,
};
use uuid::Uuid;

use crate::model::Model;
use crate::sampler::{Sampler, SamplerParams};

/// Session construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    /// Group-attention factor; 1 selects rolling context shift instead.
    pub ga_factor: u32,
    /// Group-attention width; must be a multiple of `ga_factor`.
    pub ga_width: u32,
    /// Allow rolling context shift instead of failing when context fills.
    pub infinite_context: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            ga_factor: 1,
            ga_width: 512,
            infinite_context: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Generating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    InitialPrompt,
    InteractivePrompt,
    Generated,
}

/// Completion request for [`Session::complete`].
#[derive(Debug, Default, Clone)]
pub struct CompleteParams {
    pub prompt: Vec<Token>,
    pub postfix: Vec<Token>,
    pub max_tokens: u32,
}

/// The live session. Borrows its instance's context and sampler
/// exclusively, which is what makes a second concurrent session
/// unrepresentable.
pub struct Session<'i> {
    model: Arc<Model>,
    ctx: &'i mut Box<dyn ContextBackend>,
    sampler: &'i mut Sampler,
    params: SessionParams,
    id: Uuid,

    phase: Phase,
    pending: Option<Token>,
    max_tokens: u32,
    num_keep: u32,
    ga_index: u32,
    num_past: u32,
}

impl<'i> Session<'i> {
    pub(crate) fn start(
        model: Arc<Model>,
        ctx: &'i mut Box<dyn ContextBackend>,
        sampler: &'i mut Sampler,
        params: SessionParams,
    ) -> Result<Self> {
        if params.ga_factor != 1 && params.ga_width % params.ga_factor != 0 {
            return Err(BlamaError::Config(format!(
                "group-attention width {} must be a multiple of group-attention factor {}",
                params.ga_width, params.ga_factor
            )));
        }

        ctx.kv_clear();
        ctx.perf_reset();
        sampler.reset();
        sampler.perf_reset();

        let max_tokens = ctx.n_ctx().saturating_sub(4);
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, max_tokens, "session started");

        Ok(Session {
            model,
            ctx,
            sampler,
            params,
            id,
            phase: Phase::Initial,
            pending: None,
            max_tokens,
            num_keep: 0,
            ga_index: 0,
            num_past: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Enter the generating phase by prefilling an initial prompt. An empty
    /// prompt is replaced by a single BOS token when the model has one.
    pub fn set_initial_prompt(&mut self, prompt: &[Token]) -> Result<()> {
        if self.phase != Phase::Initial {
            return Err(BlamaError::Phase("Session already started".into()));
        }

        let vocab = self.model.vocab();
        self.num_keep = (prompt.len() as u32).min(self.max_tokens);

        let bos_fallback;
        let mut prompt = prompt;
        if prompt.is_empty() {
            let bos = vocab.bos();
            if bos == TOKEN_INVALID {
                return Err(BlamaError::Config(
                    "initial prompt is empty and the model has no BOS token".into(),
                ));
            }
            bos_fallback = vec![bos];
            prompt = &bos_fallback;
        }

        if prompt.len() > self.max_tokens as usize {
            return Err(BlamaError::ResourceLimit(format!(
                "Initial prompt too long. Got {} tokens, max: {}",
                prompt.len(),
                self.max_tokens
            )));
        }

        if self.params.ga_factor != 1 {
            tracing::info!(
                "self-extend: train = {}, ga_factor = {}, ga_width = {}",
                self.model.train_ctx_length(),
                self.params.ga_factor,
                self.params.ga_width
            );
        }

        let decoder_seed;
        if self.model.has_encoder() {
            self.ctx
                .encode(prompt)
                .map_err(|e| BlamaError::Backend(format!("failed to encode input: {e}")))?;
            decoder_seed = vec![vocab.decoder_start_token()];
            prompt = &decoder_seed;
        }

        self.do_decode(prompt, Source::InitialPrompt)?;
        self.phase = Phase::Generating;
        Ok(())
    }

    /// Enter the generating phase by restoring a snapshot produced by
    /// [`Session::get_state`] on an identically-configured instance.
    pub fn set_state(&mut self, state: &[u8]) -> Result<()> {
        if self.phase != Phase::Initial {
            return Err(BlamaError::Phase("Session already started".into()));
        }
        self.num_past = self.ctx.set_state_data(state)?;
        self.phase = Phase::Generating;
        Ok(())
    }

    /// Serialize the full context state, pending token included (it is
    /// decoded first).
    pub fn get_state(&mut self) -> Result<Vec<u8>> {
        if self.phase != Phase::Generating {
            return Err(BlamaError::Phase("Session hasn't started yet".into()));
        }
        self.flush_pending()?;
        self.ctx.state_data()
    }

    /// Push an interactive prompt, optionally framed for fill-in-the-middle
    /// when `postfix` is nonempty.
    pub fn push_prompt(&mut self, prompt: &[Token], postfix: &[Token]) -> Result<()> {
        if self.phase != Phase::Generating {
            return Err(BlamaError::Phase("Session hasn't started yet".into()));
        }

        self.flush_pending()?;

        if prompt.is_empty() && postfix.is_empty() {
            return Err(BlamaError::Config("prompt and postfix are empty".into()));
        }

        // don't let previous inputs affect the new interaction
        self.sampler.reset();

        let vocab = self.model.vocab();
        let mut tokens = Vec::with_capacity(prompt.len() + postfix.len() + 4);

        if self.model.prefix_inputs_with_bos() {
            let bos = vocab.bos();
            if bos != TOKEN_INVALID {
                tokens.push(bos);
            }
        }

        let push_special = |tokens: &mut Vec<Token>, token: Token, name: &str| {
            if token >= 0 {
                tokens.push(token);
            } else {
                tracing::warn!("model doesn't have a {name} token");
            }
        };

        if !postfix.is_empty() {
            push_special(&mut tokens, vocab.fim_pre(), "FIM Prefix");
        }
        tokens.extend_from_slice(prompt);
        if !postfix.is_empty() {
            push_special(&mut tokens, vocab.fim_suf(), "FIM Suffix");
            tokens.extend_from_slice(postfix);
            push_special(&mut tokens, vocab.fim_mid(), "FIM Middle");
        }

        if tokens.len() > self.max_tokens as usize {
            return Err(BlamaError::ResourceLimit(format!(
                "Prompt too long. Got {} tokens, max: {}",
                tokens.len(),
                self.max_tokens
            )));
        }

        self.do_decode(&tokens, Source::InteractivePrompt)
    }

    /// Sample the next token. Returns a prediction whose `token` is
    /// `TOKEN_INVALID` on end of generation; otherwise the token plus the
    /// sampler-visible candidate list captured before selection. The token
    /// is decoded into context lazily by the next state-visible call.
    pub fn get_token(&mut self) -> Result<TokenPrediction> {
        if self.phase != Phase::Generating {
            return Err(BlamaError::Phase("Session hasn't started yet".into()));
        }

        self.flush_pending()?;

        let logits = self.ctx.logits().to_vec();
        let token = self.sampler.sample(&logits)?;

        if self.model.vocab().is_eog(token) {
            // don't decode end-of-generation tokens; the interaction may
            // continue with another prompt
            self.pending = None;
            return Ok(TokenPrediction {
                token: TOKEN_INVALID,
                logits: Vec::new(),
            });
        }

        self.pending = Some(token);
        let data = self.sampler.extract_token_data(&logits);
        Ok(TokenPrediction {
            token,
            logits: data,
        })
    }

    /// Push an optional prompt, then stream up to `max_tokens` predictions.
    pub fn complete(&mut self, params: CompleteParams) -> Result<Vec<TokenPrediction>> {
        if self.phase != Phase::Generating {
            return Err(BlamaError::Phase("Session hasn't started yet".into()));
        }
        if !params.prompt.is_empty() || !params.postfix.is_empty() {
            self.push_prompt(&params.prompt, &params.postfix)?;
        }

        let mut out = Vec::new();
        for _ in 0..params.max_tokens {
            let p = self.get_token()?;
            if p.token == TOKEN_INVALID {
                break;
            }
            out.push(p);
        }
        Ok(out)
    }

    /// Verifier mode: replay another instance's sampled tokens, capturing
    /// this instance's own candidate list at each step. The capture at step
    /// `i` conditions on tokens `[0, i)` only — it happens before the step's
    /// token is decoded — which keeps both sides' captures position-aligned.
    pub fn fill_ctx(&mut self, predictions: &[TokenPrediction]) -> Result<Vec<TokenPrediction>> {
        if self.phase != Phase::Generating {
            return Err(BlamaError::Phase("Session hasn't started yet".into()));
        }
        self.flush_pending()?;

        let mut out = Vec::with_capacity(predictions.len());
        for p in predictions {
            let logits = self.ctx.logits().to_vec();
            let data = self.sampler.extract_token_data(&logits);
            out.push(TokenPrediction {
                token: p.token,
                logits: data,
            });
            self.do_decode(&[p.token], Source::Generated)?;
        }
        Ok(out)
    }

    /// Replace the sampler mid-session, discarding its state.
    pub fn reset_sampler(&mut self, params: SamplerParams) -> Result<()> {
        *self.sampler = Sampler::from_backend(self.model.backend().clone(), params)?;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if let Some(token) = self.pending.take() {
            self.do_decode(&[token], Source::Generated)?;
        }
        Ok(())
    }

    fn do_decode(&mut self, tokens: &[Token], src: Source) -> Result<()> {
        let mut tokens = tokens;
        if tokens.len() > self.max_tokens as usize {
            let skipped = tokens.len() - self.max_tokens as usize;
            tokens = &tokens[..self.max_tokens as usize];
            tracing::warn!("input too long, skipping {skipped} tokens");
        }

        let ctx_len = self.ctx.n_ctx();
        let mut mitigated = false;

        if self.params.ga_factor == 1 {
            // infinite text generation via rolling context shift: keep the
            // first num_keep tokens, drop half of the rest, slide the tail
            let num = self.num_past as usize + tokens.len();
            if num >= ctx_len as usize {
                if !self.params.infinite_context {
                    return Err(BlamaError::ResourceLimit(format!(
                        "context limit of {ctx_len} reached"
                    )));
                }

                let num_left = self.num_past - self.num_keep;
                let num_discard = num_left / 2;

                tracing::debug!(
                    past = self.num_past,
                    num_left,
                    ctx_len,
                    num_keep = self.num_keep,
                    num_discard,
                    "context is full, swapping"
                );

                self.ctx
                    .kv_remove(self.num_keep, self.num_keep + num_discard);
                self.ctx.kv_shift(
                    self.num_keep + num_discard,
                    self.num_past,
                    -(num_discard as i32),
                );
                self.num_past -= num_discard;
                mitigated = true;
            }
        } else {
            let ga_factor = i64::from(self.params.ga_factor);
            let ga_width = i64::from(self.params.ga_width);

            while self.num_past >= self.ga_index + self.params.ga_width {
                // context extension via self-extend
                let ga_index = i64::from(self.ga_index);
                let num_past = i64::from(self.num_past);
                let ib = (ga_factor * ga_index) / ga_width;
                let bd = (ga_width / ga_factor) * (ga_factor - 1);
                let dd = (ga_width / ga_factor) - ib * bd - ga_width;

                tracing::debug!(ib, bd, dd, "group attention shift");

                self.ctx
                    .kv_shift(self.ga_index, self.num_past, (ib * bd) as i32);
                self.ctx.kv_divide(
                    (ga_index + ib * bd) as u32,
                    (ga_index + ib * bd + ga_width) as u32,
                    self.params.ga_factor,
                );
                self.ctx.kv_shift(
                    (ga_index + ib * bd + ga_width) as u32,
                    (num_past + ib * bd) as u32,
                    dd as i32,
                );

                self.num_past -= bd as u32;
                self.ga_index += self.params.ga_width / self.params.ga_factor;
                mitigated = true;
            }
        }

        if mitigated {
            tracing::info!(
                past = self.num_past,
                tokens = tokens.len(),
                "context full mitigation performed"
            );
        }

        // only the grammar distinguishes generated content from prompts
        for &t in tokens {
            self.sampler.accept(t, src == Source::Generated);
        }

        let batch_size = (self.ctx.n_batch() as usize).max(1);
        for chunk in tokens.chunks(batch_size) {
            self.ctx
                .decode(chunk)
                .map_err(|e| BlamaError::Backend(format!("failed to decode tokens: {e}")))?;
            self.num_past += chunk.len() as u32;
        }
        Ok(())
    }
}
