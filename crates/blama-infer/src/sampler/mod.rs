//! The composable sampler: a grammar constraint plus a main transform chain.
//!
//! Both chains are built once from [`SamplerParams`]; the per-call path
//! dispatches over closed enum variants. The main chain runs logit bias,
//! repetition penalties, then either a mirostat variant or the configured
//! transform sequence terminated by a seeded distribution step. The grammar
//! is applied independently, with a resample fallback when the sampled token
//! violates it.

mod grammar;
mod steps;

use std::sync::Arc;
use std::time::{Duration, Instant};

use blama_engine::{BlamaError, ModelBackend, Result, Token, TokenDataVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::model::Model;
pub use grammar::{Grammar, GrammarState};
use steps::Candidates;

/// Transform kinds selectable in [`SamplerParams::sampler_sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingKind {
    TopK,
    TopP,
    MinP,
    TypicalP,
    Temperature,
    Xtc,
    Infill,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepetitionPenaltyParams {
    /// Last n tokens to penalize (0 disables, negative means unbounded).
    pub num_tokens: i32,
    pub repeat: f32,
    pub freq: f32,
    pub present: f32,
}

impl Default for RepetitionPenaltyParams {
    fn default() -> Self {
        RepetitionPenaltyParams {
            num_tokens: 64,
            repeat: 1.0,
            freq: 0.0,
            present: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirostatParams {
    /// 0 disables, 1 and 2 select the variant; anything above is rejected.
    pub ver: u32,
    /// Target entropy.
    pub tau: f32,
    /// Learning rate.
    pub eta: f32,
}

impl Default for MirostatParams {
    fn default() -> Self {
        MirostatParams {
            ver: 0,
            tau: 5.0,
            eta: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XtcSamplerParams {
    /// 0 disables.
    pub probability: f32,
    /// Above 0.5 disables.
    pub threshold: f32,
}

impl Default for XtcSamplerParams {
    fn default() -> Self {
        XtcSamplerParams {
            probability: 0.0,
            threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplerParams {
    pub rng_seed: u32,
    /// Truncating transforms keep at least this many candidates (0 = off).
    pub min_keep: usize,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub temp: f32,
    pub temp_range: f32,
    pub temp_exp: f32,
    pub repetition_penalty: RepetitionPenaltyParams,
    pub mirostat: MirostatParams,
    pub xtc: XtcSamplerParams,
    pub sampler_sequence: Vec<SamplingKind>,
    /// Optional BNF-styled grammar constraining sampled output.
    pub grammar: String,
    pub logit_bias: Vec<(Token, f32)>,
}

impl Default for SamplerParams {
    fn default() -> Self {
        SamplerParams {
            rng_seed: 0,
            min_keep: 0,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            temp: 0.80,
            temp_range: 0.0,
            temp_exp: 1.0,
            repetition_penalty: RepetitionPenaltyParams::default(),
            mirostat: MirostatParams::default(),
            xtc: XtcSamplerParams::default(),
            sampler_sequence: vec![
                SamplingKind::TopK,
                SamplingKind::TypicalP,
                SamplingKind::TopP,
                SamplingKind::MinP,
                SamplingKind::Temperature,
            ],
            grammar: String::new(),
            logit_bias: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    LogitBias,
    Penalties,
    TopK(i32),
    TopP { p: f32, min_keep: usize },
    MinP { p: f32, min_keep: usize },
    TypicalP { p: f32, min_keep: usize },
    Temperature(f32),
    TemperatureExt { t: f32, range: f32, exponent: f32 },
    Xtc { probability: f32, threshold: f32, min_keep: usize },
    Infill,
    Dist,
    MirostatV1 { tau: f32, eta: f32 },
    MirostatV2 { tau: f32, eta: f32 },
}

enum GrammarConstraint {
    Unconstrained,
    Gbnf(GrammarState),
}

/// The per-instance sampler. Holds the grammar constraint and the main
/// chain together with their mutable sampling state.
pub struct Sampler {
    model: Arc<dyn ModelBackend>,
    params: SamplerParams,
    steps: Vec<Step>,
    grammar: GrammarConstraint,
    rng: StdRng,
    recent: Vec<Token>,
    mu: f32,
    sample_count: u64,
    sample_time: Duration,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(model: &Model, params: SamplerParams) -> Result<Self> {
        Self::from_backend(model.backend().clone(), params)
    }

    pub(crate) fn from_backend(
        model: Arc<dyn ModelBackend>,
        params: SamplerParams,
    ) -> Result<Self> {
        let grammar = if params.grammar.is_empty() {
            GrammarConstraint::Unconstrained
        } else {
            GrammarConstraint::Gbnf(GrammarState::new(Grammar::parse(&params.grammar)?))
        };

        let mut steps = vec![Step::LogitBias, Step::Penalties];
        match params.mirostat.ver {
            0 => {
                let min_keep = params.min_keep;
                for kind in &params.sampler_sequence {
                    steps.push(match kind {
                        SamplingKind::TopK => Step::TopK(params.top_k),
                        SamplingKind::TopP => Step::TopP {
                            p: params.top_p,
                            min_keep,
                        },
                        SamplingKind::MinP => Step::MinP {
                            p: params.min_p,
                            min_keep,
                        },
                        SamplingKind::TypicalP => Step::TypicalP {
                            p: params.typical_p,
                            min_keep,
                        },
                        SamplingKind::Temperature => Step::TemperatureExt {
                            t: params.temp,
                            range: params.temp_range,
                            exponent: params.temp_exp,
                        },
                        SamplingKind::Xtc => Step::Xtc {
                            probability: params.xtc.probability,
                            threshold: params.xtc.threshold,
                            min_keep,
                        },
                        SamplingKind::Infill => Step::Infill,
                    });
                }
                steps.push(Step::Dist);
            }
            1 => {
                steps.push(Step::Temperature(params.temp));
                steps.push(Step::MirostatV1 {
                    tau: params.mirostat.tau,
                    eta: params.mirostat.eta,
                });
            }
            2 => {
                steps.push(Step::Temperature(params.temp));
                steps.push(Step::MirostatV2 {
                    tau: params.mirostat.tau,
                    eta: params.mirostat.eta,
                });
            }
            other => {
                return Err(BlamaError::Config(format!(
                    "unsupported mirostat version {other}"
                )));
            }
        }

        let mu = 2.0 * params.mirostat.tau;
        let rng = StdRng::seed_from_u64(u64::from(params.rng_seed));
        Ok(Sampler {
            model,
            params,
            steps,
            grammar,
            rng,
            recent: Vec::new(),
            mu,
            sample_count: 0,
            sample_time: Duration::ZERO,
        })
    }

    /// Clear sampling state in both chains.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(u64::from(self.params.rng_seed));
        self.recent.clear();
        self.mu = 2.0 * self.params.mirostat.tau;
        if let GrammarConstraint::Gbnf(state) = &mut self.grammar {
            state.reset();
        }
    }

    /// Clear the main chain's perf counters.
    pub fn perf_reset(&mut self) {
        self.sample_count = 0;
        self.sample_time = Duration::ZERO;
    }

    pub fn perf_sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Advance sampling state with an accepted token. The grammar advances
    /// only for generated content (`accept_grammar`).
    pub fn accept(&mut self, token: Token, accept_grammar: bool) {
        if accept_grammar {
            self.grammar_accept(token);
        }
        let window = self.params.repetition_penalty.num_tokens;
        if window != 0 {
            self.recent.push(token);
            if window > 0 && self.recent.len() > window as usize {
                let excess = self.recent.len() - window as usize;
                self.recent.drain(..excess);
            }
        }
    }

    /// Sample a token from a logits view (one entry per vocabulary id).
    pub fn sample(&mut self, logits: &[f32]) -> Result<Token> {
        self.sample_with(logits, false)
    }

    /// Extended sampling: apply the main chain, then check the selection
    /// against the grammar; on violation resample with the grammar applied
    /// first. `grammar_first` forces the slower grammar-then-chain order,
    /// useful when every remaining candidate must satisfy the grammar.
    pub fn sample_with(&mut self, logits: &[f32], grammar_first: bool) -> Result<Token> {
        let started = Instant::now();
        let result = self.sample_inner(logits, grammar_first);
        self.sample_count += 1;
        self.sample_time += started.elapsed();
        result
    }

    fn sample_inner(&mut self, logits: &[f32], grammar_first: bool) -> Result<Token> {
        let mut cur = Candidates::from_logits(logits);

        if grammar_first {
            self.grammar_apply(&mut cur);
            self.apply_chain(&mut cur);
            return Self::selected_token(&cur, "sampling");
        }

        self.apply_chain(&mut cur);
        let id = Self::selected_token(&cur, "sampling")?;

        // fast path: test the choice against the grammar in isolation
        let mut single = Candidates::single(id, 1.0);
        self.grammar_apply(&mut single);
        if single.data[0].logit != f32::NEG_INFINITY {
            return Ok(id);
        }

        // resample with the grammar constraining the candidate set up front
        let mut cur = Candidates::from_logits(logits);
        self.grammar_apply(&mut cur);
        self.apply_chain(&mut cur);
        Self::selected_token(&cur, "re-sampling")
    }

    /// Apply the main chain only and return the resulting ordered candidate
    /// list (the per-step distribution reported to clients and comparers).
    pub fn extract_token_data(&mut self, logits: &[f32]) -> TokenDataVector {
        let mut cur = Candidates::from_logits(logits);
        self.apply_chain(&mut cur);
        cur.data
    }

    fn selected_token(cur: &Candidates, phase: &str) -> Result<Token> {
        match cur.selected {
            Some(i) => Ok(cur.data[i].token),
            None => Err(BlamaError::Config(format!(
                "no selected token during {phase} - check your sampling configuration"
            ))),
        }
    }

    fn apply_chain(&mut self, cur: &mut Candidates) {
        let n_vocab = self.model.vocab().n_tokens();
        for step in self.steps.clone() {
            match step {
                Step::LogitBias => steps::logit_bias(cur, &self.params.logit_bias),
                Step::Penalties => {
                    let p = &self.params.repetition_penalty;
                    steps::penalties(cur, &self.recent, p.repeat, p.freq, p.present);
                }
                Step::TopK(k) => steps::top_k(cur, k),
                Step::TopP { p, min_keep } => steps::top_p(cur, p, min_keep),
                Step::MinP { p, min_keep } => steps::min_p(cur, p, min_keep),
                Step::TypicalP { p, min_keep } => steps::typical_p(cur, p, min_keep),
                Step::Temperature(t) => steps::temperature(cur, t),
                Step::TemperatureExt { t, range, exponent } => {
                    steps::temperature_ext(cur, t, range, exponent)
                }
                Step::Xtc {
                    probability,
                    threshold,
                    min_keep,
                } => steps::xtc(cur, probability, threshold, min_keep, &mut self.rng),
                Step::Infill => self.infill(cur),
                Step::Dist => steps::dist(cur, &mut self.rng),
                Step::MirostatV1 { tau, eta } => steps::mirostat_v1(
                    cur,
                    n_vocab,
                    tau,
                    eta,
                    100,
                    &mut self.mu,
                    &mut self.rng,
                ),
                Step::MirostatV2 { tau, eta } => {
                    steps::mirostat_v2(cur, tau, eta, &mut self.mu, &mut self.rng)
                }
            }
        }
    }

    /// Suppress end-of-generation while substantial continuation mass
    /// remains; once EOG dominates, commit to it.
    fn infill(&self, cur: &mut Candidates) {
        cur.softmax();
        let vocab = self.model.vocab();
        let p_eog: f32 = cur
            .data
            .iter()
            .filter(|d| vocab.is_eog(d.token))
            .map(|d| d.prob)
            .sum();
        if p_eog > 0.9 {
            cur.data.retain(|d| vocab.is_eog(d.token));
        } else {
            for d in &mut cur.data {
                if vocab.is_eog(d.token) {
                    d.logit = f32::NEG_INFINITY;
                }
            }
            cur.sorted = false;
        }
    }

    fn grammar_apply(&mut self, cur: &mut Candidates) {
        let GrammarConstraint::Gbnf(state) = &self.grammar else {
            return;
        };
        let vocab = self.model.vocab();
        for d in &mut cur.data {
            if vocab.is_eog(d.token) {
                if !state.allows_end() {
                    d.logit = f32::NEG_INFINITY;
                }
            } else {
                let piece = vocab.token_to_piece(d.token, false);
                if !piece.is_empty() && !state.allows(&piece) {
                    d.logit = f32::NEG_INFINITY;
                }
            }
        }
        cur.sorted = false;
    }

    fn grammar_accept(&mut self, token: Token) {
        let GrammarConstraint::Gbnf(state) = &mut self.grammar else {
            return;
        };
        let vocab = self.model.vocab();
        if vocab.is_eog(token) {
            return;
        }
        let piece = vocab.token_to_piece(token, false);
        if !piece.is_empty() {
            state.accept(&piece);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParams;
    use blama_runtime::MockLoader;
    use std::path::Path;

    fn model() -> std::sync::Arc<Model> {
        Model::load(
            &MockLoader::default(),
            Path::new("model.gguf"),
            ModelParams::default(),
            None,
        )
        .unwrap()
    }

    fn flat_logits(n: usize) -> Vec<f32> {
        vec![0.0; n]
    }

    #[test]
    fn default_chain_samples_deterministically_per_seed() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        logits[20] = 6.0;
        logits[21] = 5.5;

        let mut s1 = Sampler::new(&model, SamplerParams::default()).unwrap();
        let mut s2 = Sampler::new(&model, SamplerParams::default()).unwrap();
        assert_eq!(s1.sample(&logits).unwrap(), s2.sample(&logits).unwrap());
    }

    #[test]
    fn reset_restores_rng_stream() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        for i in 0..n {
            logits[i] = (i % 13) as f32 * 0.3;
        }

        let mut s = Sampler::new(&model, SamplerParams::default()).unwrap();
        let first: Vec<Token> = (0..5).map(|_| s.sample(&logits).unwrap()).collect();
        s.reset();
        let second: Vec<Token> = (0..5).map(|_| s.sample(&logits).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn greedy_temperature_picks_argmax() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        logits[33] = 9.0;

        let mut s = Sampler::new(
            &model,
            SamplerParams {
                temp: 0.0,
                ..SamplerParams::default()
            },
        )
        .unwrap();
        assert_eq!(s.sample(&logits).unwrap(), 33);
    }

    #[test]
    fn mirostat_version_above_two_is_rejected() {
        let model = model();
        let err = Sampler::new(
            &model,
            SamplerParams {
                mirostat: MirostatParams {
                    ver: 3,
                    ..MirostatParams::default()
                },
                ..SamplerParams::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("mirostat"));
    }

    #[test]
    fn mirostat_chains_sample() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        for i in 0..n {
            logits[i] = ((i * 7) % 5) as f32;
        }
        for ver in [1, 2] {
            let mut s = Sampler::new(
                &model,
                SamplerParams {
                    mirostat: MirostatParams {
                        ver,
                        ..MirostatParams::default()
                    },
                    ..SamplerParams::default()
                },
            )
            .unwrap();
            s.sample(&logits).unwrap();
        }
    }

    #[test]
    fn logit_bias_steers_greedy_choice() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        logits[10] = 3.0;

        let mut s = Sampler::new(
            &model,
            SamplerParams {
                temp: 0.0,
                logit_bias: vec![(11, 10.0)],
                ..SamplerParams::default()
            },
        )
        .unwrap();
        assert_eq!(s.sample(&logits).unwrap(), 11);
    }

    #[test]
    fn repetition_penalty_discourages_repeats() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        logits[10] = 2.0;
        logits[11] = 1.9;

        let mut s = Sampler::new(
            &model,
            SamplerParams {
                temp: 0.0,
                repetition_penalty: RepetitionPenaltyParams {
                    num_tokens: 64,
                    repeat: 2.0,
                    freq: 0.5,
                    present: 0.5,
                    },
                ..SamplerParams::default()
            },
        )
        .unwrap();
        assert_eq!(s.sample(&logits).unwrap(), 10);
        s.accept(10, false);
        assert_eq!(s.sample(&logits).unwrap(), 11);
    }

    #[test]
    fn grammar_constrains_selection_via_resample() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        // favor a token whose piece is " hello"; constrain to digits
        let hello = model.vocab().tokenize("hello", false, false)[0];
        let mut logits = flat_logits(n);
        logits[hello as usize] = 9.0;
        let two = model.vocab().tokenize("two", false, false)[0];
        logits[two as usize] = 5.0;

        let mut s = Sampler::new(
            &model,
            SamplerParams {
                temp: 0.0,
                grammar: "root ::= (\" two\" | \" three\")+".to_string(),
                ..SamplerParams::default()
            },
        )
        .unwrap();
        let picked = s.sample(&logits).unwrap();
        assert_eq!(picked, two);
        s.accept(picked, true);
    }

    #[test]
    fn invalid_grammar_is_config_error() {
        let model = model();
        let err = Sampler::new(
            &model,
            SamplerParams {
                grammar: "root = broken".to_string(),
                ..SamplerParams::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, BlamaError::Config(_)));
    }

    #[test]
    fn extract_token_data_orders_by_chain() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let mut logits = flat_logits(n);
        logits[5] = 4.0;
        logits[6] = 3.0;

        let mut s = Sampler::new(&model, SamplerParams::default()).unwrap();
        let data = s.extract_token_data(&logits);
        assert!(!data.is_empty());
        assert_eq!(data[0].token, 5);
        assert!(data.len() <= 40); // default top-k bound
    }

    #[test]
    fn perf_counters_reset_independently() {
        let model = model();
        let n = model.vocab().n_tokens() as usize;
        let logits = flat_logits(n);
        let mut s = Sampler::new(&model, SamplerParams::default()).unwrap();
        s.sample(&logits).unwrap();
        assert_eq!(s.perf_sample_count(), 1);
        s.perf_reset();
        assert_eq!(s.perf_sample_count(), 0);
    }
}
