//! Wire types for the four endpoints.

use serde::{Deserialize, Serialize};

fn default_temp() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

/// `POST /complete` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteRequest {
    pub prompt: String,
    /// 0 selects the server's default budget.
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub seed: u32,
    /// Nonempty turns the request into fill-in-the-middle completion.
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_temp", rename = "temp")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

/// One chat turn as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// `POST /chat/completions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompleteRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub seed: u32,
    #[serde(default = "default_temp", rename = "temp")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

/// Per-candidate logit entry reported with each generated token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogit {
    pub id: i32,
    pub logit: f32,
}

/// One generated token with its sampler-visible distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictedToken {
    #[serde(rename = "str")]
    pub text: String,
    pub id: i32,
    pub logits: Vec<TokenLogit>,
}

/// Completion payload: the concatenated text plus per-token data.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteResponse {
    pub text: String,
    #[serde(rename = "tokenData")]
    pub token_data: Vec<PredictedToken>,
}

impl CompleteResponse {
    pub fn from_tokens(token_data: Vec<PredictedToken>) -> Self {
        let text = token_data.iter().map(|t| t.text.as_str()).collect();
        CompleteResponse { text, token_data }
    }
}

/// The completion payload as accepted back by the verify endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponseBody {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "tokenData")]
    pub token_data: Vec<PredictedToken>,
}

/// `POST /verify_completion` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub request: CompleteRequest,
    pub response: CompleteResponseBody,
}

/// `POST /chat/verify_completion` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatVerifyRequest {
    pub request: ChatCompleteRequest,
    pub response: CompleteResponseBody,
}

/// Verify result payload.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub result: f32,
}
