//! Vocabulary access over the backend.

use std::sync::Arc;

use blama_engine::{ModelBackend, Token, TOKEN_INVALID};

/// String↔token conversion and special-token lookups for one model.
#[derive(Clone)]
pub struct Vocab {
    model: Arc<dyn ModelBackend>,
}

impl Vocab {
    pub(crate) fn new(model: Arc<dyn ModelBackend>) -> Self {
        Vocab { model }
    }

    pub fn n_tokens(&self) -> u32 {
        self.model.vocab().n_tokens()
    }

    pub fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<Token> {
        self.model.vocab().tokenize(text, add_special, parse_special)
    }

    /// Render a token, special tokens included.
    pub fn token_to_string(&self, token: Token) -> String {
        self.token_to_string_with(token, true)
    }

    pub fn token_to_string_with(&self, token: Token, special: bool) -> String {
        self.model.vocab().token_to_piece(token, special)
    }

    /// End-of-generation test.
    pub fn is_eog(&self, token: Token) -> bool {
        self.model.vocab().is_eog(token)
    }

    pub fn should_add_bos(&self) -> bool {
        self.model.vocab().should_add_bos()
    }

    pub fn bos(&self) -> Token {
        self.model.vocab().bos()
    }

    pub fn eos(&self) -> Token {
        self.model.vocab().eos()
    }

    pub fn fim_pre(&self) -> Token {
        self.model.vocab().fim_pre()
    }

    pub fn fim_suf(&self) -> Token {
        self.model.vocab().fim_suf()
    }

    pub fn fim_mid(&self) -> Token {
        self.model.vocab().fim_mid()
    }

    /// Decoder-start token of encoder-decoder models, falling back to BOS.
    pub fn decoder_start_token(&self) -> Token {
        let t = self.model.vocab().decoder_start();
        if t != TOKEN_INVALID {
            t
        } else {
            self.bos()
        }
    }
}
