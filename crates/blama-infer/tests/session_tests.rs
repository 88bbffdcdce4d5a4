//! Session state machine scenarios against the reference backend.
//!
//! Covers the phase rules, prompt budgets, pending-token flushing, state
//! snapshot round-trips, both context-fit mitigations, and the verifier
//! replay path.

use std::path::Path;
use std::sync::Arc;

use blama_engine::{Token, TokenPrediction, TOKEN_INVALID};
use blama_infer::{
    CompleteParams, Instance, InstanceParams, LogitComparer, MetricsAggregator, Model,
    ModelParams, SamplerParams, SessionParams,
};
use blama_runtime::{MockLoader, MockModelDesc};

fn load_model(desc: MockModelDesc) -> Arc<Model> {
    Model::load(
        &MockLoader::new(desc),
        Path::new("model.gguf"),
        ModelParams::default(),
        None,
    )
    .unwrap()
}

fn default_model() -> Arc<Model> {
    load_model(MockModelDesc::default())
}

/// A wide, flat sampling configuration whose choices depend on the RNG
/// stream, not just the argmax.
fn flat_sampler() -> SamplerParams {
    SamplerParams {
        rng_seed: 1717,
        temp: 8.0,
        top_k: 0,
        top_p: 1.0,
        min_p: 0.0,
        ..SamplerParams::default()
    }
}

fn tokens_of(preds: &[TokenPrediction]) -> Vec<Token> {
    preds.iter().map(|p| p.token).collect()
}

// -- phase rules --

#[test]
fn operations_require_generating_phase() {
    let model = default_model();
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();

    let err = s.complete(CompleteParams::default()).unwrap_err();
    assert_eq!(err.to_string(), "Session hasn't started yet");

    let err = s.get_state().unwrap_err();
    assert_eq!(err.to_string(), "Session hasn't started yet");

    let err = s.push_prompt(&[5, 6], &[]).unwrap_err();
    assert_eq!(err.to_string(), "Session hasn't started yet");

    let err = s.get_token().unwrap_err();
    assert_eq!(err.to_string(), "Session hasn't started yet");
}

#[test]
fn double_initialization_is_rejected() {
    let model = default_model();
    let tokens = model.vocab().tokenize("hello world", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    let err = s.set_state(&[]).unwrap_err();
    assert_eq!(err.to_string(), "Session already started");

    let err = s.set_initial_prompt(&tokens).unwrap_err();
    assert_eq!(err.to_string(), "Session already started");
}

#[test]
fn group_attention_width_must_divide() {
    let model = default_model();
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let err = inst
        .start_session(SessionParams {
            ga_factor: 4,
            ga_width: 30,
            infinite_context: true,
        })
        .err()
        .unwrap();
    assert!(err.to_string().contains("multiple"));
}

// -- prompts and budgets --

#[test]
fn empty_initial_prompt_falls_back_to_bos() {
    let model = default_model();
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&[]).unwrap();
    let p = s.get_token().unwrap();
    assert_ne!(p.token, TOKEN_INVALID);
}

#[test]
fn oversized_initial_prompt_is_rejected() {
    let model = load_model(MockModelDesc {
        train_ctx_length: 64,
        ..MockModelDesc::default()
    });
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();

    let prompt: Vec<Token> = (0..61).map(|i| 5 + (i % 70)).collect();
    let err = s.set_initial_prompt(&prompt).unwrap_err();
    assert!(err.to_string().contains("Initial prompt too long"));
}

#[test]
fn push_prompt_rejects_empty_input() {
    let model = default_model();
    let tokens = model.vocab().tokenize("hello", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    let err = s.push_prompt(&[], &[]).unwrap_err();
    assert!(err.to_string().contains("empty"));
}

#[test]
fn fim_postfix_frames_the_prompt() {
    let model = default_model();
    let tokens = model.vocab().tokenize("hello", true, true);
    let mut inst = Instance::new(model.clone(), InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    let prompt = model.vocab().tokenize("one", false, false);
    let postfix = model.vocab().tokenize("two", false, false);
    s.push_prompt(&prompt, &postfix).unwrap();
    let p = s.get_token().unwrap();
    assert_ne!(p.token, TOKEN_INVALID);
}

// -- generation --

#[test]
fn complete_streams_predictions_with_logit_data() {
    let model = default_model();
    let tokens = model.vocab().tokenize("president george", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    let preds = s
        .complete(CompleteParams {
            max_tokens: 5,
            ..CompleteParams::default()
        })
        .unwrap();
    assert!(!preds.is_empty());
    for p in &preds {
        assert_ne!(p.token, TOKEN_INVALID);
        assert!(!p.logits.is_empty());
        // index 0 is the chain's current top
        assert!(p.logits[0].logit >= p.logits[p.logits.len() - 1].logit);
    }
}

#[test]
fn greedy_generation_is_instance_independent() {
    let model = default_model();
    let tokens = model.vocab().tokenize("president george", true, true);

    let run = |model: &Arc<Model>| {
        let mut inst = Instance::new(model.clone(), InstanceParams::default()).unwrap();
        inst.reset_sampler(SamplerParams {
            temp: 0.0,
            ..SamplerParams::default()
        })
        .unwrap();
        let mut s = inst.start_session(SessionParams::default()).unwrap();
        s.set_initial_prompt(&tokens).unwrap();
        tokens_of(
            &s.complete(CompleteParams {
                max_tokens: 8,
                ..CompleteParams::default()
            })
            .unwrap(),
        )
    };

    assert_eq!(run(&model), run(&model));
}

#[test]
fn sampler_can_be_swapped_mid_session() {
    let model = default_model();
    let tokens = model.vocab().tokenize("president george", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    s.reset_sampler(SamplerParams {
        temp: 0.0,
        ..SamplerParams::default()
    })
    .unwrap();
    let a = s.get_token().unwrap();
    assert_ne!(a.token, TOKEN_INVALID);
}

#[test]
fn end_of_generation_yields_invalid_token() {
    let model = default_model();
    let eos = model.vocab().eos();
    let tokens = model.vocab().tokenize("hello world", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    // bias end-of-generation far above everything, sampled greedily
    inst.reset_sampler(SamplerParams {
        temp: 0.0,
        logit_bias: vec![(eos, 100.0)],
        ..SamplerParams::default()
    })
    .unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    let p = s.get_token().unwrap();
    assert_eq!(p.token, TOKEN_INVALID);
    assert!(p.logits.is_empty());

    // complete observes the same terminal and returns an empty stream
    let preds = s
        .complete(CompleteParams {
            max_tokens: 4,
            ..CompleteParams::default()
        })
        .unwrap();
    assert!(preds.is_empty());
}

// -- pending token --

#[test]
fn streamed_token_enters_state_on_next_operation_only() {
    let model = default_model();
    let tokens = model.vocab().tokenize("hello world", true, true);

    // stream one token, then snapshot: the pending token is flushed into
    // the snapshot by get_state
    let mut inst = Instance::new(model.clone(), InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();
    let p = s.get_token().unwrap();
    assert_ne!(p.token, TOKEN_INVALID);
    let with_pending = s.get_state().unwrap();
    drop(s);

    // snapshot without streaming
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();
    let without_pending = s.get_state().unwrap();

    assert!(with_pending.len() > without_pending.len());
}

// -- state snapshot / restore --

#[test]
fn initial_state_round_trip_replays_identically() {
    let model = default_model();
    let tokens = model.vocab().tokenize("france has a long history of", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    inst.reset_sampler(flat_sampler()).unwrap();

    let (snapshot, original) = {
        let mut s = inst.start_session(SessionParams::default()).unwrap();
        s.set_initial_prompt(&tokens).unwrap();
        let snapshot = s.get_state().unwrap();
        let preds = s
            .complete(CompleteParams {
                max_tokens: 15,
                ..CompleteParams::default()
            })
            .unwrap();
        (snapshot, tokens_of(&preds))
    };

    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_state(&snapshot).unwrap();
    let restored = tokens_of(
        &s.complete(CompleteParams {
            max_tokens: 15,
            ..CompleteParams::default()
        })
        .unwrap(),
    );

    // the sampler was reset at the same point, so the replay matches
    assert_eq!(original, restored);
}

#[test]
fn mid_state_restore_diverges_from_original_but_is_stable() {
    let model = default_model();
    let tokens = model.vocab().tokenize("france has a long history of", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    inst.reset_sampler(flat_sampler()).unwrap();

    let (mid_snapshot, continuation) = {
        let mut s = inst.start_session(SessionParams::default()).unwrap();
        s.set_initial_prompt(&tokens).unwrap();
        let _first = s
            .complete(CompleteParams {
                max_tokens: 15,
                ..CompleteParams::default()
            })
            .unwrap();
        let mid = s.get_state().unwrap();
        let second = s
            .complete(CompleteParams {
                max_tokens: 15,
                ..CompleteParams::default()
            })
            .unwrap();
        (mid, tokens_of(&second))
    };

    let restore = |inst: &mut Instance| {
        let mut s = inst.start_session(SessionParams::default()).unwrap();
        s.set_state(&mid_snapshot).unwrap();
        tokens_of(
            &s.complete(CompleteParams {
                max_tokens: 15,
                ..CompleteParams::default()
            })
            .unwrap(),
        )
    };

    let a = restore(&mut inst);
    let b = restore(&mut inst);

    // each restored run resets the sampler RNG, so they agree with each
    // other and disagree with the continuation whose RNG had advanced
    assert_eq!(a, b);
    assert_ne!(a, continuation);
}

#[test]
fn garbage_state_blob_is_rejected() {
    let model = default_model();
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    assert!(s.set_state(b"not a snapshot").is_err());
}

// -- context-fit mitigation --

#[test]
fn infinite_context_generates_past_the_window() {
    let model = load_model(MockModelDesc {
        train_ctx_length: 64,
        ..MockModelDesc::default()
    });
    let tokens = model.vocab().tokenize("hello world", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    // far more than the 64-token window
    let mut generated = 0;
    for _ in 0..100 {
        let p = s.get_token().unwrap();
        if p.token == TOKEN_INVALID {
            break;
        }
        generated += 1;
    }
    assert!(generated > 64);
}

#[test]
fn bounded_context_errors_when_full() {
    let model = load_model(MockModelDesc {
        train_ctx_length: 64,
        ..MockModelDesc::default()
    });
    let tokens = model.vocab().tokenize("hello world", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst
        .start_session(SessionParams {
            infinite_context: false,
            ..SessionParams::default()
        })
        .unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    let mut saw_limit = false;
    for _ in 0..100 {
        match s.get_token() {
            Ok(p) if p.token == TOKEN_INVALID => break,
            Ok(_) => {}
            Err(e) => {
                assert!(e.to_string().contains("context limit"));
                saw_limit = true;
                break;
            }
        }
    }
    assert!(saw_limit);
}

#[test]
fn self_extend_keeps_generating() {
    let model = load_model(MockModelDesc {
        train_ctx_length: 128,
        ..MockModelDesc::default()
    });
    let tokens = model.vocab().tokenize("hello world of stories", true, true);
    let mut inst = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = inst
        .start_session(SessionParams {
            ga_factor: 2,
            ga_width: 32,
            infinite_context: true,
        })
        .unwrap();
    s.set_initial_prompt(&tokens).unwrap();

    for _ in 0..60 {
        let p = s.get_token().unwrap();
        if p.token == TOKEN_INVALID {
            break;
        }
    }
    // the grouped window kept the session inside its budget
    assert!(s.get_state().unwrap().len() > 8);
}

// -- verifier replay --

#[test]
fn fill_ctx_aligns_with_the_primary_capture() {
    let model = default_model();
    let tokens = model.vocab().tokenize("president george", true, true);

    // primary: stream predictions
    let mut primary = Instance::new(model.clone(), InstanceParams::default()).unwrap();
    let mut s = primary.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();
    let mut preds = Vec::new();
    for _ in 0..10 {
        let p = s.get_token().unwrap();
        if p.token == TOKEN_INVALID {
            break;
        }
        preds.push(p);
    }
    drop(s);
    assert!(!preds.is_empty());

    // verifier: same model, fresh instance, replayed tokens
    let mut verifier = Instance::new(model, InstanceParams::default()).unwrap();
    let mut s = verifier.start_session(SessionParams::default()).unwrap();
    s.set_initial_prompt(&tokens).unwrap();
    let verified = s.fill_ctx(&preds).unwrap();
    assert_eq!(verified.len(), preds.len());

    let mut agg = MetricsAggregator::new();
    let mut score = 0.0;
    let mut sim_sum = 0.0;
    for (a, b) in preds.iter().zip(&verified) {
        assert_eq!(a.token, b.token);
        let m = LogitComparer::compare(&a.logits, &b.logits);
        assert_eq!(m.top1_match, 1.0);
        sim_sum += LogitComparer::logit_similarity(&a.logits, &b.logits);
        score = agg.push_and_verify(&[m]);
    }

    assert!(score >= 0.95, "aggregate score {score}");
    assert!(
        sim_sum / preds.len() as f32 >= 0.98,
        "avg similarity {}",
        sim_sum / preds.len() as f32
    );
}
