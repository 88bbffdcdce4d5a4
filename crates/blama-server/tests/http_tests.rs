//! End-to-end protocol tests over the router with the reference backend.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use blama_infer::{InstanceParams, Model, ModelParams};
use blama_runtime::{MockLoader, MockModelDesc};
use blama_server::{create_router, AppState, Server};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_state() -> AppState {
    let loader = MockLoader::new(MockModelDesc::default());
    let model = Model::load(
        &loader,
        Path::new("test-model.gguf"),
        ModelParams::default(),
        None,
    )
    .unwrap();
    let server = Server::new(model, InstanceParams::default()).unwrap();
    AppState {
        server: Arc::new(server),
    }
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn json_of(resp: axum::response::Response) -> Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

// -- protocol shape --

#[tokio::test]
async fn non_post_requests_are_bad_requests() {
    let app = create_router(test_state());
    let req = Request::builder()
        .method("GET")
        .uri("/complete")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn non_post_unknown_path_is_bad_request() {
    let app = create_router(test_state());
    let req = Request::builder()
        .method("GET")
        .uri("/nothing")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let app = create_router(test_state());
    let req = json_request("/completions", json!({"prompt": "x"}));
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// -- /complete --

#[tokio::test]
async fn complete_returns_text_and_token_data() {
    let app = create_router(test_state());
    let req = json_request(
        "/complete",
        json!({"prompt": "president george", "max_tokens": 4, "temp": 0.0}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/json")
    );

    let body = json_of(resp).await;
    let text = body["text"].as_str().unwrap();
    assert!(!text.is_empty());
    let token_data = body["tokenData"].as_array().unwrap();
    assert_eq!(token_data.len(), 4);
    for token in token_data {
        assert!(token["id"].as_i64().unwrap() >= 0);
        assert!(!token["str"].as_str().unwrap().is_empty());
        let logits = token["logits"].as_array().unwrap();
        assert!(!logits.is_empty());
        assert!(logits[0]["logit"].is_number());
    }
}

#[tokio::test]
async fn complete_is_deterministic_for_a_seed() {
    let state = test_state();
    let run = |state: AppState| async move {
        let app = create_router(state);
        let req = json_request(
            "/complete",
            json!({"prompt": "hello world", "max_tokens": 6, "seed": 42}),
        );
        let resp = app.oneshot(req).await.unwrap();
        json_of(resp).await["text"].as_str().unwrap().to_string()
    };

    let a = run(state.clone()).await;
    let b = run(state).await;
    assert_eq!(a, b);
}

#[tokio::test]
async fn complete_with_suffix_runs_infill() {
    let app = create_router(test_state());
    let req = json_request(
        "/complete",
        json!({"prompt": "one two", "suffix": "four five", "max_tokens": 2}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_of(resp).await;
    assert_eq!(body["tokenData"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let app = create_router(test_state());
    let req = Request::builder()
        .method("POST")
        .uri("/complete")
        .header("content-type", "application/json")
        .body(Body::from("{\"no_prompt\": 1}"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_ne!(resp.status(), StatusCode::OK);
}

// -- /chat/completions --

#[tokio::test]
async fn chat_complete_formats_messages() {
    let app = create_router(test_state());
    let req = json_request(
        "/chat/completions",
        json!({
            "messages": [
                {"role": "system", "content": "you are the assistant"},
                {"role": "user", "content": "hello world"}
            ],
            "max_tokens": 3
        }),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_of(resp).await;
    assert_eq!(body["tokenData"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn chat_complete_rejects_empty_messages() {
    let app = create_router(test_state());
    let req = json_request("/chat/completions", json!({"messages": []}));
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// -- verification round trips --

#[tokio::test]
async fn verify_accepts_own_completion() {
    let state = test_state();

    let app = create_router(state.clone());
    let request_body = json!({"prompt": "president george", "max_tokens": 8, "seed": 7});
    let resp = app
        .oneshot(json_request("/complete", request_body.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let completion = json_of(resp).await;

    let app = create_router(state);
    let resp = app
        .oneshot(json_request(
            "/verify_completion",
            json!({"request": request_body, "response": completion}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_of(resp).await;
    let result = body["result"].as_f64().unwrap();
    assert!(result >= 0.95, "verify score {result}");
}

#[tokio::test]
async fn chat_verify_accepts_own_completion() {
    let state = test_state();
    let request_body = json!({
        "messages": [
            {"role": "user", "content": "hello world"}
        ],
        "max_tokens": 5,
        "seed": 3
    });

    let app = create_router(state.clone());
    let resp = app
        .oneshot(json_request("/chat/completions", request_body.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let completion = json_of(resp).await;

    let app = create_router(state);
    let resp = app
        .oneshot(json_request(
            "/chat/verify_completion",
            json!({"request": request_body, "response": completion}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_of(resp).await;
    assert!(body["result"].as_f64().unwrap() >= 0.95);
}

#[tokio::test]
async fn verify_scores_mismatched_logits_lower() {
    let state = test_state();
    let request_body = json!({"prompt": "hello world", "max_tokens": 5, "seed": 9});

    let app = create_router(state.clone());
    let resp = app
        .oneshot(json_request("/complete", request_body.clone()))
        .await
        .unwrap();
    let mut completion = json_of(resp).await;

    // corrupt the reported logits
    for token in completion["tokenData"].as_array_mut().unwrap() {
        for logit in token["logits"].as_array_mut().unwrap() {
            let v = logit["logit"].as_f64().unwrap();
            logit["logit"] = json!(v * 3.0 + 11.0);
        }
    }

    let app = create_router(state);
    let resp = app
        .oneshot(json_request(
            "/verify_completion",
            json!({"request": request_body, "response": completion}),
        ))
        .await
        .unwrap();
    let body = json_of(resp).await;
    let result = body["result"].as_f64().unwrap();
    assert!(result < 0.95, "corrupted logits scored {result}");
}

// -- job serialization --

#[tokio::test]
async fn concurrent_requests_are_serialized_onto_one_worker() {
    let state = test_state();
    let mut handles = Vec::new();
    for seed in 0..4u32 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let app = create_router(state);
            let req = json_request(
                "/complete",
                json!({"prompt": "hello world", "max_tokens": 3, "seed": seed}),
            );
            let resp = app.oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}
