//! Token identifiers and per-token sampling data.

/// Token ID type (i32 for runtime compat; logically non-negative).
pub type Token = i32;

/// Sentinel for "no token" at API boundaries.
pub const TOKEN_INVALID: Token = -1;

/// A single vocabulary entry as seen by the sampler chain.
///
/// `prob` is zero unless a softmax step ran over the candidate array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub token: Token,
    pub logit: f32,
    pub prob: f32,
}

impl TokenData {
    pub fn new(token: Token, logit: f32) -> Self {
        TokenData {
            token,
            logit,
            prob: 0.0,
        }
    }
}

/// Candidate list in the order the sampler chain produced it.
///
/// Index 0 is the chain's current "top". Probabilities may be unnormalized
/// unless a softmax was applied.
pub type TokenDataVector = Vec<TokenData>;

/// One generated token together with the sampler-visible distribution
/// captured *before* selection.
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    pub token: Token,
    pub logits: TokenDataVector,
}

/// A single chat turn. Role strings are free-form (conventionally
/// `system`/`user`/`assistant`); the chat template decides their handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMsg {
    pub role: String,
    pub text: String,
}

impl ChatMsg {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        ChatMsg {
            role: role.into(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_data_defaults_prob_to_zero() {
        let d = TokenData::new(42, 1.5);
        assert_eq!(d.token, 42);
        assert_eq!(d.logit, 1.5);
        assert_eq!(d.prob, 0.0);
    }

    #[test]
    fn invalid_token_is_negative() {
        assert!(TOKEN_INVALID < 0);
    }
}
