//! # blama-runtime
//!
//! Deterministic reference backend for the blama engine traits.
//!
//! The real tensor runtime is an external collaborator; this crate stands in
//! for it with a toy model whose logits are a pure function of the tokens
//! resident in the KV sequence and their positions. That is enough to
//! exercise every serving-layer invariant: prefill/decode ordering, context
//! shifting, state snapshot round-trips, sampler determinism, and
//! cross-instance logit comparison.
//!
//! Two instances built from the same descriptor produce identical logits for
//! identical sequences, so the verification path scores a self-comparison as
//! equivalent.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blama_engine::{
    BlamaError, ContextBackend, ContextParams, LoadProgressFn, ModelBackend, ModelLoadParams,
    ModelLoader, Result, Token, VocabBackend, TOKEN_INVALID,
};

const STATE_MAGIC: u32 = 0x424C_5354; // "BLST"

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = seed ^ 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Map a hash to a float in `[-1, 1)`.
fn unit_float(h: u64) -> f32 {
    ((h >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

/// Descriptor for building a mock model. The loader uses defaults; tests
/// tweak fields to shape the model they need.
#[derive(Debug, Clone)]
pub struct MockModelDesc {
    pub train_ctx_length: u32,
    pub n_layer: u32,
    pub n_embd: u32,
    pub has_encoder: bool,
    pub has_decoder: bool,
    pub add_bos: bool,
    /// String metadata (e.g. `tokenizer.chat_template`).
    pub metadata: Vec<(String, String)>,
}

impl Default for MockModelDesc {
    fn default() -> Self {
        MockModelDesc {
            train_ctx_length: 1024,
            n_layer: 12,
            n_embd: 384,
            has_encoder: false,
            has_decoder: true,
            add_bos: false,
            metadata: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

const SPECIAL_PIECES: &[&str] = &["<s>", "</s>", "<fim_pre>", "<fim_suf>", "<fim_mid>"];
const TOKEN_BOS: Token = 0;
const TOKEN_EOS: Token = 1;
const TOKEN_FIM_PRE: Token = 2;
const TOKEN_FIM_SUF: Token = 3;
const TOKEN_FIM_MID: Token = 4;

/// Wordlist vocabulary: every plain token is a space-prefixed word so that
/// detokenized streams read naturally. Unknown words hash into the word
/// range, which keeps tokenization total at the cost of round-tripping only
/// for known words.
const WORDS: &[&str] = &[
    "the", "a", "of", "to", "and", "in", "is", "was", "it", "for", "on", "with", "as", "at",
    "by", "from", "that", "this", "be", "are", "or", "an", "not", "you", "we", "they", "he",
    "she", "has", "had", "will", "would", "can", "could", "one", "two", "three", "four", "five",
    "president", "george", "bush", "rain", "troops", "cleveland", "torrential", "sent", "hit",
    "which", "hello", "world", "story", "character", "loved", "eat", "user", "assistant",
    "system", "question", "answer", "model", "token", "sample", "state", "exit", "quit", "down",
    "stream", "shut", "cancel", "france", "history", "long", "time", "people", "country",
];

struct MockVocab {
    pieces: Vec<String>,
    add_bos: bool,
}

impl MockVocab {
    fn new(add_bos: bool) -> Self {
        let mut pieces: Vec<String> = SPECIAL_PIECES.iter().map(|s| s.to_string()).collect();
        pieces.extend(WORDS.iter().map(|w| format!(" {w}")));
        MockVocab { pieces, add_bos }
    }

    fn word_token(&self, word: &str) -> Token {
        let lowered = word.to_lowercase();
        for (i, piece) in self.pieces.iter().enumerate().skip(SPECIAL_PIECES.len()) {
            if piece[1..] == lowered {
                return i as Token;
            }
        }
        // unknown word: hash into the word range
        let n_words = (self.pieces.len() - SPECIAL_PIECES.len()) as u64;
        let h = fnv1a(7, lowered.as_bytes());
        (SPECIAL_PIECES.len() as u64 + h % n_words) as Token
    }
}

impl VocabBackend for MockVocab {
    fn n_tokens(&self) -> u32 {
        self.pieces.len() as u32
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<Token> {
        let mut out = Vec::new();
        if add_special && self.add_bos {
            out.push(TOKEN_BOS);
        }
        for word in text.split_whitespace() {
            if parse_special {
                if let Some(i) = SPECIAL_PIECES.iter().position(|s| *s == word) {
                    out.push(i as Token);
                    continue;
                }
            }
            out.push(self.word_token(word));
        }
        out
    }

    fn token_to_piece(&self, token: Token, special: bool) -> String {
        if token < 0 || token as usize >= self.pieces.len() {
            return String::new();
        }
        if !special && (token as usize) < SPECIAL_PIECES.len() {
            return String::new();
        }
        self.pieces[token as usize].clone()
    }

    fn is_eog(&self, token: Token) -> bool {
        token == TOKEN_EOS
    }

    fn should_add_bos(&self) -> bool {
        self.add_bos
    }

    fn bos(&self) -> Token {
        TOKEN_BOS
    }

    fn eos(&self) -> Token {
        TOKEN_EOS
    }

    fn fim_pre(&self) -> Token {
        TOKEN_FIM_PRE
    }

    fn fim_suf(&self) -> Token {
        TOKEN_FIM_SUF
    }

    fn fim_mid(&self) -> Token {
        TOKEN_FIM_MID
    }

    fn decoder_start(&self) -> Token {
        TOKEN_INVALID
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub struct MockModel {
    id: u64,
    desc: MockModelDesc,
    vocab: MockVocab,
    vocab_only: bool,
    next_lora: AtomicU64,
}

impl MockModel {
    pub fn new(desc: MockModelDesc) -> Arc<Self> {
        Self::with_params(desc, ModelLoadParams::default())
    }

    pub fn with_params(desc: MockModelDesc, params: ModelLoadParams) -> Arc<Self> {
        let vocab = MockVocab::new(desc.add_bos);
        Arc::new(MockModel {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            desc,
            vocab,
            vocab_only: params.vocab_only,
            next_lora: AtomicU64::new(1),
        })
    }
}

impl ModelBackend for MockModel {
    fn train_ctx_length(&self) -> u32 {
        if self.vocab_only {
            0
        } else {
            self.desc.train_ctx_length
        }
    }

    fn has_encoder(&self) -> bool {
        self.desc.has_encoder
    }

    fn has_decoder(&self) -> bool {
        self.desc.has_decoder
    }

    fn n_layer(&self) -> u32 {
        self.desc.n_layer
    }

    fn n_embd(&self) -> u32 {
        self.desc.n_embd
    }

    fn meta_value(&self, key: &str) -> Option<String> {
        self.desc
            .metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn vocab(&self) -> &dyn VocabBackend {
        &self.vocab
    }

    fn new_context(&self, params: ContextParams) -> Result<Box<dyn ContextBackend>> {
        if self.vocab_only {
            return Err(BlamaError::Backend(
                "cannot create a context on a vocab-only model".into(),
            ));
        }
        let n_ctx = if params.n_ctx == 0 {
            self.desc.train_ctx_length
        } else {
            params.n_ctx
        };
        // logits are seeded by the descriptor, not the handle id: two loads
        // of the same "file" must predict identically
        let mut seed = fnv1a(0x6d6f_6465, &self.desc.train_ctx_length.to_le_bytes());
        seed = fnv1a(seed, &self.desc.n_layer.to_le_bytes());
        seed = fnv1a(seed, &self.desc.n_embd.to_le_bytes());
        Ok(Box::new(MockContext {
            model_seed: seed,
            n_vocab: self.vocab.n_tokens() as usize,
            n_embd: self.desc.n_embd as usize,
            n_ctx,
            n_batch: params.n_batch.max(1),
            pooled: params.embeddings,
            entries: Vec::new(),
            encoder_entries: Vec::new(),
            logits: Vec::new(),
            lora: Vec::new(),
            control: None,
        }))
    }

    fn load_lora(&self, path: &Path) -> Result<u64> {
        if !path.exists() {
            return Err(BlamaError::Data(format!(
                "lora adapter not found: {}",
                path.display()
            )));
        }
        Ok(self.next_lora.fetch_add(1, Ordering::Relaxed))
    }

    fn model_id(&self) -> u64 {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

struct MockContext {
    model_seed: u64,
    n_vocab: usize,
    n_embd: usize,
    n_ctx: u32,
    n_batch: u32,
    pooled: bool,
    /// KV occupancy: one `(position, token)` entry per resident token.
    entries: Vec<(i64, Token)>,
    encoder_entries: Vec<Token>,
    logits: Vec<f32>,
    lora: Vec<(u64, f32)>,
    control: Option<Vec<f32>>,
}

impl MockContext {
    fn next_pos(&self) -> i64 {
        self.entries.iter().map(|&(p, _)| p + 1).max().unwrap_or(0)
    }

    /// Pure function of the full KV contents (plus adapters): the logits
    /// "the model" would produce after attending over `entries`.
    fn compute_logits(&mut self) {
        let mut seed = self.model_seed;
        for &(pos, token) in &self.entries {
            seed = fnv1a(seed, &pos.to_le_bytes());
            seed = fnv1a(seed, &token.to_le_bytes());
        }
        for &(handle, scale) in &self.lora {
            seed = fnv1a(seed, &handle.to_le_bytes());
            seed = fnv1a(seed, &scale.to_le_bytes());
        }
        if let Some(cv) = &self.control {
            for f in cv {
                seed = fnv1a(seed, &f.to_le_bytes());
            }
        }

        let last = self.entries.last().map(|&(_, t)| t).unwrap_or(0);
        // A strongly suggested successor makes greedy decoding predictable;
        // special tokens stay strongly negative so generation only ends when
        // a caller biases it to.
        let n_special = SPECIAL_PIECES.len() as u64;
        let n_plain = self.n_vocab as u64 - n_special;
        let favored = n_special + (last as u64 * 7 + 11) % n_plain;

        self.logits = (0..self.n_vocab)
            .map(|i| {
                let noise = unit_float(fnv1a(seed, &(i as u32).to_le_bytes()));
                if (i as u64) < n_special {
                    -50.0 + noise
                } else if i as u64 == favored {
                    8.0 + noise
                } else {
                    noise * 4.0
                }
            })
            .collect();
    }

    fn embedding_from_seed(&self, seed: u64) -> Vec<f32> {
        (0..self.n_embd)
            .map(|i| unit_float(fnv1a(seed, &(i as u32).to_le_bytes())))
            .collect()
    }
}

impl ContextBackend for MockContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.n_batch
    }

    fn decode(&mut self, tokens: &[Token]) -> Result<()> {
        if tokens.is_empty() {
            return Err(BlamaError::Backend("empty decode batch".into()));
        }
        if self.entries.len() + tokens.len() > self.n_ctx as usize {
            return Err(BlamaError::Backend(format!(
                "KV slab exhausted: {} + {} > {}",
                self.entries.len(),
                tokens.len(),
                self.n_ctx
            )));
        }
        let mut pos = self.next_pos();
        for &t in tokens {
            self.entries.push((pos, t));
            pos += 1;
        }
        self.compute_logits();
        Ok(())
    }

    fn encode(&mut self, tokens: &[Token]) -> Result<()> {
        if tokens.is_empty() {
            return Err(BlamaError::Backend("empty encode batch".into()));
        }
        self.encoder_entries = tokens.to_vec();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn kv_remove(&mut self, start: u32, end: u32) {
        let (start, end) = (i64::from(start), i64::from(end));
        self.entries.retain(|&(p, _)| p < start || p >= end);
    }

    fn kv_shift(&mut self, start: u32, end: u32, delta: i32) {
        let (start, end) = (i64::from(start), i64::from(end));
        for entry in &mut self.entries {
            if entry.0 >= start && entry.0 < end {
                entry.0 += i64::from(delta);
            }
        }
        self.entries.retain(|&(p, _)| p >= 0);
        self.entries.sort_by_key(|&(p, _)| p);
    }

    fn kv_divide(&mut self, start: u32, end: u32, divisor: u32) {
        if divisor == 0 {
            return;
        }
        let (start, end) = (i64::from(start), i64::from(end));
        for entry in &mut self.entries {
            if entry.0 >= start && entry.0 < end {
                entry.0 /= i64::from(divisor);
            }
        }
        self.entries.sort_by_key(|&(p, _)| p);
    }

    fn kv_clear(&mut self) {
        self.entries.clear();
        self.logits.clear();
    }

    fn state_data(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * 12);
        out.extend_from_slice(&STATE_MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for &(pos, token) in &self.entries {
            out.extend_from_slice(&pos.to_le_bytes());
            out.extend_from_slice(&token.to_le_bytes());
        }
        Ok(out)
    }

    fn set_state_data(&mut self, data: &[u8]) -> Result<u32> {
        let fail = || BlamaError::Backend("malformed context state blob".into());
        if data.len() < 8 {
            return Err(fail());
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != STATE_MAGIC {
            return Err(fail());
        }
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if data.len() != 8 + count * 12 {
            return Err(fail());
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let base = 8 + i * 12;
            let pos = i64::from_le_bytes(data[base..base + 8].try_into().unwrap());
            let token = Token::from_le_bytes(data[base + 8..base + 12].try_into().unwrap());
            entries.push((pos, token));
        }
        self.entries = entries;
        self.compute_logits();
        Ok(count as u32)
    }

    fn pooled_embeddings(&self) -> bool {
        self.pooled
    }

    fn embeddings_seq(&self) -> Option<Vec<f32>> {
        if !self.pooled {
            return None;
        }
        let mut seed = fnv1a(self.model_seed, b"embd");
        let tokens: Vec<Token> = if self.encoder_entries.is_empty() {
            self.entries.iter().map(|&(_, t)| t).collect()
        } else {
            self.encoder_entries.clone()
        };
        for t in tokens {
            seed = fnv1a(seed, &t.to_le_bytes());
        }
        Some(self.embedding_from_seed(seed))
    }

    fn embeddings_ith(&self, i: usize) -> Option<Vec<f32>> {
        if self.pooled {
            return None;
        }
        let &(pos, token) = self.entries.get(i)?;
        let mut seed = fnv1a(self.model_seed, b"embd_ith");
        seed = fnv1a(seed, &pos.to_le_bytes());
        seed = fnv1a(seed, &token.to_le_bytes());
        Some(self.embedding_from_seed(seed))
    }

    fn set_lora(&mut self, adapter: u64, scale: f32) -> Result<()> {
        self.lora.push((adapter, scale));
        Ok(())
    }

    fn clear_lora(&mut self) {
        self.lora.clear();
    }

    fn apply_control_vector(
        &mut self,
        data: &[f32],
        n_embd: i32,
        layer_start: u32,
        layer_end: u32,
    ) -> Result<()> {
        if n_embd != self.n_embd as i32 {
            return Err(BlamaError::Backend(format!(
                "control vector width {} does not match model width {}",
                n_embd, self.n_embd
            )));
        }
        if layer_start > layer_end {
            return Err(BlamaError::Backend(
                "control vector layer range is inverted".into(),
            ));
        }
        self.control = Some(data.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Loader producing mock models. The GGUF path selects nothing; the
/// descriptor shapes everything. Progress is reported as a 0→1 ramp so
/// observers see the same callbacks a real load produces.
#[derive(Debug, Clone, Default)]
pub struct MockLoader {
    pub desc: MockModelDesc,
}

impl MockLoader {
    pub fn new(desc: MockModelDesc) -> Self {
        MockLoader { desc }
    }
}

impl ModelLoader for MockLoader {
    fn load_model(
        &self,
        path: &Path,
        params: ModelLoadParams,
        progress: Option<LoadProgressFn<'_>>,
    ) -> Result<Arc<dyn ModelBackend>> {
        tracing::debug!(path = %path.display(), gpu = params.gpu, "loading mock model");
        if let Some(cb) = progress {
            for step in 0..=4 {
                cb(step as f32 / 4.0);
            }
        }
        Ok(MockModel::with_params(self.desc.clone(), params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Box<dyn ContextBackend> {
        MockModel::new(MockModelDesc::default())
            .new_context(ContextParams::default())
            .unwrap()
    }

    #[test]
    fn vocab_tokenizes_known_words() {
        let model = MockModel::new(MockModelDesc::default());
        let vocab = model.vocab();
        let tokens = vocab.tokenize("hello world", true, true);
        assert_eq!(tokens.len(), 2);
        let text: String = tokens
            .iter()
            .map(|&t| vocab.token_to_piece(t, false))
            .collect();
        assert_eq!(text, " hello world");
    }

    #[test]
    fn vocab_parses_special_pieces() {
        let model = MockModel::new(MockModelDesc::default());
        let vocab = model.vocab();
        assert_eq!(vocab.tokenize("<s>", false, true), vec![TOKEN_BOS]);
        // without parse_special the piece is treated as a plain word
        assert_ne!(vocab.tokenize("<s>", false, false), vec![TOKEN_BOS]);
    }

    #[test]
    fn decode_is_deterministic() {
        let mut a = context();
        let mut b = context();
        a.decode(&[5, 6, 7]).unwrap();
        b.decode(&[5, 6, 7]).unwrap();
        assert_eq!(a.logits(), b.logits());
    }

    #[test]
    fn logits_depend_on_positions() {
        let mut a = context();
        a.decode(&[5, 6, 7, 8]).unwrap();
        let before = a.logits().to_vec();
        a.kv_remove(1, 2);
        a.kv_shift(2, 4, -1);
        a.decode(&[9]).unwrap();
        let after = a.logits().to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn state_round_trip_restores_logits() {
        let mut a = context();
        a.decode(&[10, 11, 12]).unwrap();
        let snapshot = a.state_data().unwrap();
        let expected = a.logits().to_vec();

        let mut b = context();
        assert_eq!(b.set_state_data(&snapshot).unwrap(), 3);
        assert_eq!(b.logits(), expected.as_slice());
    }

    #[test]
    fn set_state_rejects_garbage() {
        let mut c = context();
        assert!(c.set_state_data(b"nonsense").is_err());
    }

    #[test]
    fn kv_divide_compresses_positions() {
        let mut c = context();
        c.decode(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        c.kv_divide(0, 8, 4);
        // positions 0..8 collapse to 0,0,0,0,1,1,1,1; decode resumes after max
        c.decode(&[9]).unwrap();
        let state = c.state_data().unwrap();
        let count = u32::from_le_bytes(state[4..8].try_into().unwrap());
        assert_eq!(count, 9);
    }

    #[test]
    fn vocab_only_model_has_no_context() {
        let model = MockModel::with_params(
            MockModelDesc::default(),
            ModelLoadParams {
                gpu: true,
                vocab_only: true,
            },
        );
        assert_eq!(model.train_ctx_length(), 0);
        assert!(model.new_context(ContextParams::default()).is_err());
    }

    #[test]
    fn pooled_embeddings_only_on_embedding_contexts() {
        let model = MockModel::new(MockModelDesc::default());
        let mut plain = model.new_context(ContextParams::default()).unwrap();
        plain.decode(&[5]).unwrap();
        assert!(plain.embeddings_seq().is_none());

        let mut emb = model
            .new_context(ContextParams {
                embeddings: true,
                ..ContextParams::default()
            })
            .unwrap();
        emb.decode(&[5]).unwrap();
        let v = emb.embeddings_seq().unwrap();
        assert_eq!(v.len(), 384);
    }

    #[test]
    fn loader_reports_progress() {
        use std::sync::Mutex;
        let seen = Mutex::new(Vec::new());
        let cb = |p: f32| seen.lock().unwrap().push(p);
        let loader = MockLoader::default();
        loader
            .load_model(Path::new("model.gguf"), ModelLoadParams::default(), Some(&cb))
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
    }
}
