//! Model ownership and metadata.

use std::path::Path;
use std::sync::Arc;

use blama_engine::{LoadProgressFn, ModelBackend, ModelLoadParams, ModelLoader, Result};

use crate::vocab::Vocab;

/// Immutable model construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParams {
    /// Prefer GPU device placement; `false` forces CPU-only.
    pub gpu: bool,
    /// Load the vocabulary only, skipping tensor data.
    pub vocab_only: bool,
    /// Prefix interactive inputs with BOS when pushing prompts.
    pub prefix_inputs_with_bos: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        ModelParams {
            gpu: true,
            vocab_only: false,
            prefix_inputs_with_bos: false,
        }
    }
}

/// A loaded model: the backend handle, its parameters, and its vocabulary.
/// Shared immutably; outlives every instance built on it.
pub struct Model {
    backend: Arc<dyn ModelBackend>,
    params: ModelParams,
    vocab: Vocab,
}

impl Model {
    /// Load a model through a backend loader. The progress observer is
    /// invoked with values in `[0, 1]`; loading always runs to completion.
    pub fn load(
        loader: &dyn ModelLoader,
        gguf: &Path,
        params: ModelParams,
        progress: Option<LoadProgressFn<'_>>,
    ) -> Result<Arc<Self>> {
        let backend = loader.load_model(
            gguf,
            ModelLoadParams {
                gpu: params.gpu,
                vocab_only: params.vocab_only,
            },
            progress,
        )?;
        Ok(Self::from_backend(backend, params))
    }

    /// Wrap an already-loaded backend handle.
    pub fn from_backend(backend: Arc<dyn ModelBackend>, params: ModelParams) -> Arc<Self> {
        let vocab = Vocab::new(backend.clone());
        Arc::new(Model {
            backend,
            params,
            vocab,
        })
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    /// Context length the model was trained with (0 for vocab-only loads).
    pub fn train_ctx_length(&self) -> u32 {
        self.backend.train_ctx_length()
    }

    pub fn should_add_bos(&self) -> bool {
        self.vocab.should_add_bos()
    }

    pub fn has_encoder(&self) -> bool {
        self.backend.has_encoder()
    }

    pub fn has_decoder(&self) -> bool {
        self.backend.has_decoder()
    }

    pub fn n_layer(&self) -> u32 {
        self.backend.n_layer()
    }

    pub fn n_embd(&self) -> u32 {
        self.backend.n_embd()
    }

    pub fn prefix_inputs_with_bos(&self) -> bool {
        self.params.prefix_inputs_with_bos
    }

    /// Chat template identifier from model metadata, `"chatml"` when the
    /// model carries none.
    pub fn chat_template_id(&self) -> String {
        self.backend
            .meta_value("tokenizer.chat_template")
            .unwrap_or_else(|| "chatml".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blama_runtime::{MockLoader, MockModelDesc};

    #[test]
    fn load_reports_monotone_progress() {
        use std::sync::Mutex;
        let seen = Mutex::new(Vec::new());
        let cb = |p: f32| seen.lock().unwrap().push(p);
        let loader = MockLoader::default();
        let model = Model::load(
            &loader,
            Path::new("model.gguf"),
            ModelParams::default(),
            Some(&cb),
        )
        .unwrap();
        assert!(model.train_ctx_length() > 0);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[test]
    fn vocab_only_model_has_no_training_context() {
        let loader = MockLoader::default();
        let model = Model::load(
            &loader,
            Path::new("model.gguf"),
            ModelParams {
                vocab_only: true,
                ..ModelParams::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(model.train_ctx_length(), 0);
        // the vocabulary still works
        assert!(!model.vocab().tokenize("hello world", true, true).is_empty());
    }

    #[test]
    fn chat_template_falls_back_to_chatml() {
        let loader = MockLoader::default();
        let model =
            Model::load(&loader, Path::new("m.gguf"), ModelParams::default(), None).unwrap();
        assert_eq!(model.chat_template_id(), "chatml");

        let loader = MockLoader::new(MockModelDesc {
            metadata: vec![(
                "tokenizer.chat_template".to_string(),
                "llama3".to_string(),
            )],
            ..MockModelDesc::default()
        });
        let model =
            Model::load(&loader, Path::new("m.gguf"), ModelParams::default(), None).unwrap();
        assert_eq!(model.chat_template_id(), "llama3");
    }
}
