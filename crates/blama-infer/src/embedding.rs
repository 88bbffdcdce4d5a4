//! Pooled-embedding forward pass, parallel to the text-generation instance.

use std::sync::Arc;

use blama_engine::{BlamaError, ContextBackend, ContextParams, Result, Token};

use crate::model::Model;

/// Context parameters for an embedding instance.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingInstanceParams {
    pub ctx_size: u32,
    pub batch_size: u32,
    pub ubatch_size: u32,
    pub flash_attn: bool,
}

impl Default for EmbeddingInstanceParams {
    fn default() -> Self {
        EmbeddingInstanceParams {
            ctx_size: 0,
            batch_size: 2048,
            ubatch_size: 512,
            flash_attn: false,
        }
    }
}

/// An embeddings-enabled context over a single sequence.
pub struct EmbeddingInstance {
    model: Arc<Model>,
    ctx: Box<dyn ContextBackend>,
}

impl std::fmt::Debug for EmbeddingInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingInstance").finish_non_exhaustive()
    }
}

impl EmbeddingInstance {
    /// Create the embedding context. Encoder-decoder models are rejected:
    /// their pooled embeddings are not defined by this path.
    pub fn new(model: Arc<Model>, params: EmbeddingInstanceParams) -> Result<Self> {
        if model.has_encoder() && model.has_decoder() {
            tracing::error!("computing embeddings in encoder-decoder models is not supported");
            return Err(BlamaError::Config(
                "computing embeddings in encoder-decoder models is not supported".into(),
            ));
        }

        let ctx = model.backend().new_context(ContextParams {
            n_ctx: params.ctx_size,
            n_batch: params.batch_size,
            n_ubatch: params.ubatch_size,
            flash_attn: params.flash_attn,
            embeddings: true,
        })?;

        let ctx_len = ctx.n_ctx();
        let ctx_train = model.train_ctx_length();
        if ctx_len > ctx_train {
            tracing::warn!(
                "instance requested context length {ctx_len} is greater than the model's \
                 training context length {ctx_train}"
            );
        }

        Ok(EmbeddingInstance { model, ctx })
    }

    pub fn embedding_dim(&self) -> u32 {
        self.model.n_embd()
    }

    /// Run the prompt through the model and return its (normalized)
    /// embedding vector.
    ///
    /// Normalization selector: `-1` identity, `0` max-absolute scaled to the
    /// int16 range, `2` Euclidean, anything else a p-norm with
    /// `p = normalization`.
    pub fn get_embedding_vector(&mut self, prompt: &[Token], normalization: i32) -> Result<Vec<f32>> {
        self.ctx.kv_clear();

        if self.model.has_encoder() && !self.model.has_decoder() {
            self.ctx
                .encode(prompt)
                .map_err(|e| BlamaError::Backend(format!("failed to encode: {e}")))?;
        } else {
            self.ctx
                .decode(prompt)
                .map_err(|e| BlamaError::Backend(format!("failed to decode: {e}")))?;
        }

        let raw = if self.ctx.pooled_embeddings() {
            self.ctx.embeddings_seq()
        } else {
            // the last token's embedding captures the whole sequence
            self.ctx.embeddings_ith(prompt.len().saturating_sub(1))
        }
        .ok_or_else(|| BlamaError::Backend("failed to get embeddings".into()))?;

        Ok(normalize_embedding(&raw, normalization))
    }
}

fn normalize_embedding(inp: &[f32], embd_norm: i32) -> Vec<f32> {
    let sum: f64 = match embd_norm {
        -1 => 1.0,
        0 => {
            // max absolute, scaled to an int16 range
            let max_abs = inp.iter().fold(0.0f64, |m, &v| m.max(f64::from(v.abs())));
            max_abs / 32760.0
        }
        2 => inp
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt(),
        p => inp
            .iter()
            .map(|&v| f64::from(v.abs()).powi(p))
            .sum::<f64>()
            .powf(1.0 / f64::from(p)),
    };

    let norm = if sum > 0.0 { (1.0 / sum) as f32 } else { 0.0 };
    inp.iter().map(|&v| v * norm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParams;
    use blama_runtime::{MockLoader, MockModelDesc};
    use std::path::Path;

    fn model(desc: MockModelDesc) -> Arc<Model> {
        Model::load(
            &MockLoader::new(desc),
            Path::new("embed.gguf"),
            ModelParams::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn l2_normalized_embedding_has_unit_norm() {
        let model = model(MockModelDesc {
            n_embd: 384,
            train_ctx_length: 512,
            ..MockModelDesc::default()
        });
        let tokens = model.vocab().tokenize(
            "the main character in the story loved to eat",
            true,
            true,
        );
        let mut inst = EmbeddingInstance::new(model, EmbeddingInstanceParams::default()).unwrap();
        assert_eq!(inst.embedding_dim(), 384);

        let v = inst.get_embedding_vector(&tokens, 2).unwrap();
        assert_eq!(v.len(), 384);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3, "norm = {norm}");
    }

    #[test]
    fn identity_normalization_preserves_values() {
        let model = model(MockModelDesc::default());
        let tokens = model.vocab().tokenize("hello world", true, true);
        let mut inst = EmbeddingInstance::new(model, EmbeddingInstanceParams::default()).unwrap();

        let raw = inst.get_embedding_vector(&tokens, -1).unwrap();
        let l2 = inst.get_embedding_vector(&tokens, 2).unwrap();
        assert_eq!(raw.len(), l2.len());
        // identity leaves magnitudes untouched; same direction as l2
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!(norm > 1.0e-3);
        let dot: f32 = raw.iter().zip(&l2).map(|(a, b)| a * b).sum();
        assert!(dot > 0.0);
    }

    #[test]
    fn max_abs_normalization_scales_into_int16_range() {
        let v = vec![1.0f32, -2.0, 0.5];
        let out = normalize_embedding(&v, 0);
        let max = out.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!((max - 32760.0).abs() < 1.0);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let v = vec![0.0f32; 8];
        for norm in [-1, 0, 2, 3] {
            let out = normalize_embedding(&v, norm);
            assert!(out.iter().all(|&x| x == 0.0), "norm {norm}");
        }
    }

    #[test]
    fn encoder_decoder_models_are_rejected() {
        let model = model(MockModelDesc {
            has_encoder: true,
            has_decoder: true,
            ..MockModelDesc::default()
        });
        let err = EmbeddingInstance::new(model, EmbeddingInstanceParams::default()).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn embeddings_are_deterministic_per_prompt() {
        let model = model(MockModelDesc::default());
        let tokens = model.vocab().tokenize("hello world", true, true);
        let mut a = EmbeddingInstance::new(model.clone(), EmbeddingInstanceParams::default())
            .unwrap();
        let mut b = EmbeddingInstance::new(model, EmbeddingInstanceParams::default()).unwrap();
        assert_eq!(
            a.get_embedding_vector(&tokens, 2).unwrap(),
            b.get_embedding_vector(&tokens, 2).unwrap()
        );
    }
}
