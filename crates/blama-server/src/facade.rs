//! The server façade: one model, one instance, one inference worker.
//!
//! Jobs are queued FIFO onto a dedicated OS thread that owns the instance;
//! each decode runs there to completion with no suspension. Callers await a
//! oneshot that the worker fulfills, so completion handlers resume on the
//! transport executor they came from.

use std::sync::Arc;
use std::thread;

use blama_engine::{BlamaError, Result, TokenData, TokenPrediction};
use blama_infer::{
    ChatFormat, CompleteParams, Instance, InstanceParams, LogitComparer, MetricsAggregator,
    Model, SamplerParams, SessionParams,
};
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::oneshot;

use crate::models::{
    ChatCompleteRequest, ChatMessage, CompleteRequest, CompleteResponseBody, PredictedToken,
    TokenLogit,
};

/// Generation budget used when a request leaves `max_tokens` at 0.
const DEFAULT_MAX_TOKENS: u32 = 256;

enum Job {
    Complete {
        params: CompleteRequest,
        reply: oneshot::Sender<Result<Vec<PredictedToken>>>,
    },
    ChatComplete {
        params: ChatCompleteRequest,
        reply: oneshot::Sender<Result<Vec<PredictedToken>>>,
    },
    Verify {
        request: CompleteRequest,
        response: CompleteResponseBody,
        reply: oneshot::Sender<Result<f32>>,
    },
    ChatVerify {
        request: ChatCompleteRequest,
        response: CompleteResponseBody,
        reply: oneshot::Sender<Result<f32>>,
    },
    Shutdown,
}

/// Owns the inference worker. All operations for one server are serialized
/// through its queue, which is what upholds the single-live-session rule.
pub struct Server {
    jobs: Sender<Job>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Build the façade: create the instance, warm it up, and spawn the
    /// worker thread.
    pub fn new(model: Arc<Model>, params: InstanceParams) -> Result<Self> {
        let mut instance = Instance::new(model.clone(), params)?;
        instance.warmup()?;

        let (jobs, rx) = crossbeam_channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("inference-worker".into())
            .spawn(move || worker_loop(model, instance, rx))
            .map_err(|e| BlamaError::Backend(format!("failed to spawn inference worker: {e}")))?;

        Ok(Server {
            jobs,
            worker: Some(worker),
        })
    }

    pub async fn complete_text(&self, params: CompleteRequest) -> Result<Vec<PredictedToken>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Complete { params, reply })?;
        Self::await_reply(rx).await
    }

    pub async fn chat_complete(
        &self,
        params: ChatCompleteRequest,
    ) -> Result<Vec<PredictedToken>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::ChatComplete { params, reply })?;
        Self::await_reply(rx).await
    }

    pub async fn verify(
        &self,
        request: CompleteRequest,
        response: CompleteResponseBody,
    ) -> Result<f32> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Verify {
            request,
            response,
            reply,
        })?;
        Self::await_reply(rx).await
    }

    pub async fn chat_verify(
        &self,
        request: ChatCompleteRequest,
        response: CompleteResponseBody,
    ) -> Result<f32> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::ChatVerify {
            request,
            response,
            reply,
        })?;
        Self::await_reply(rx).await
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| BlamaError::Backend("inference worker is gone".into()))
    }

    async fn await_reply<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await
            .map_err(|_| BlamaError::Backend("inference worker dropped the job".into()))?
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(model: Arc<Model>, mut instance: Instance, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Complete { params, reply } => {
                let _ = reply.send(run_complete(&model, &mut instance, params));
            }
            Job::ChatComplete { params, reply } => {
                let _ = reply.send(run_chat_complete(&model, &mut instance, params));
            }
            Job::Verify {
                request,
                response,
                reply,
            } => {
                let _ = reply.send(run_verify(&model, &mut instance, request, response));
            }
            Job::ChatVerify {
                request,
                response,
                reply,
            } => {
                let chat = run_chat_prompt(&model, &request.messages);
                let result = chat.and_then(|prompt| {
                    run_verify_prompt(
                        &model,
                        &mut instance,
                        &prompt,
                        request.seed,
                        request.temperature,
                        request.top_p,
                        response,
                    )
                });
                let _ = reply.send(result);
            }
            Job::Shutdown => break,
        }
    }
    tracing::debug!("inference worker stopped");
}

fn sampler_for(seed: u32, temperature: f32, top_p: f32) -> SamplerParams {
    SamplerParams {
        rng_seed: seed,
        temp: temperature,
        top_p,
        ..SamplerParams::default()
    }
}

fn budget(max_tokens: u32) -> u32 {
    if max_tokens == 0 {
        DEFAULT_MAX_TOKENS
    } else {
        max_tokens
    }
}

fn to_predicted(model: &Model, preds: Vec<TokenPrediction>) -> Vec<PredictedToken> {
    preds
        .into_iter()
        .map(|p| PredictedToken {
            text: model.vocab().token_to_string(p.token),
            id: p.token,
            logits: p
                .logits
                .iter()
                .map(|d| TokenLogit {
                    id: d.token,
                    logit: d.logit,
                })
                .collect(),
        })
        .collect()
}

fn run_complete(
    model: &Model,
    instance: &mut Instance,
    params: CompleteRequest,
) -> Result<Vec<PredictedToken>> {
    instance.reset_sampler(sampler_for(params.seed, params.temperature, params.top_p))?;

    let tokens = model.vocab().tokenize(&params.prompt, true, true);
    let postfix = if params.suffix.is_empty() {
        Vec::new()
    } else {
        model.vocab().tokenize(&params.suffix, false, false)
    };

    let mut session = instance.start_session(SessionParams::default())?;
    session.set_initial_prompt(&tokens)?;
    let preds = session.complete(CompleteParams {
        prompt: Vec::new(),
        postfix,
        max_tokens: budget(params.max_tokens),
    })?;
    drop(session);

    Ok(to_predicted(model, preds))
}

/// Resolve the model's chat template and render the message array with a
/// generation prompt. Template metadata problems degrade to the built-in
/// renderer rather than failing the request.
fn run_chat_prompt(model: &Model, messages: &[ChatMessage]) -> Result<String> {
    let chat: Vec<blama_engine::ChatMsg> = messages
        .iter()
        .map(|m| blama_engine::ChatMsg::new(m.role.clone(), m.content.clone()))
        .collect();

    let params = ChatFormat::chat_params_for_model(model);
    let looks_like_jinja =
        params.chat_template.contains("{%") || params.chat_template.contains("{{");

    let fmt = if params.chat_template.is_empty() {
        ChatFormat::new(model.chat_template_id())?
    } else if looks_like_jinja {
        let template = params.chat_template.clone();
        match ChatFormat::with_params(params) {
            Ok(fmt) => fmt,
            Err(err) => {
                tracing::warn!("model chat template rejected ({err}), trying legacy renderer");
                ChatFormat::new(template)?
            }
        }
    } else {
        ChatFormat::new(params.chat_template)?
    };

    fmt.format_chat(&chat, true)
}

fn run_chat_complete(
    model: &Model,
    instance: &mut Instance,
    params: ChatCompleteRequest,
) -> Result<Vec<PredictedToken>> {
    let prompt = run_chat_prompt(model, &params.messages)?;
    run_complete(
        model,
        instance,
        CompleteRequest {
            prompt,
            max_tokens: params.max_tokens,
            seed: params.seed,
            suffix: String::new(),
            temperature: params.temperature,
            top_p: params.top_p,
        },
    )
}

fn run_verify(
    model: &Model,
    instance: &mut Instance,
    request: CompleteRequest,
    response: CompleteResponseBody,
) -> Result<f32> {
    run_verify_prompt(
        model,
        instance,
        &request.prompt,
        request.seed,
        request.temperature,
        request.top_p,
        response,
    )
}

fn run_verify_prompt(
    model: &Model,
    instance: &mut Instance,
    prompt: &str,
    seed: u32,
    temperature: f32,
    top_p: f32,
    response: CompleteResponseBody,
) -> Result<f32> {
    instance.reset_sampler(sampler_for(seed, temperature, top_p))?;

    let original: Vec<TokenPrediction> = response
        .token_data
        .iter()
        .map(|t| TokenPrediction {
            token: t.id,
            logits: t
                .logits
                .iter()
                .map(|l| TokenData::new(l.id, l.logit))
                .collect(),
        })
        .collect();

    let tokens = model.vocab().tokenize(prompt, true, true);
    let mut session = instance.start_session(SessionParams::default())?;
    session.set_initial_prompt(&tokens)?;
    let verified = session.fill_ctx(&original)?;
    drop(session);

    let mut aggregator = MetricsAggregator::new();
    let mut score = 0.0;
    for (orig, check) in original.iter().zip(&verified) {
        let metrics = LogitComparer::compare(&orig.logits, &check.logits);
        score = aggregator.push_and_verify(&[metrics]);
    }
    Ok(score)
}
