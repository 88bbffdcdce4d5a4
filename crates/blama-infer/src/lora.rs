//! LoRA adapters, loaded per model and attached to instances by reference.

use std::path::Path;

use blama_engine::Result;

use crate::model::Model;

/// A low-rank adapter bound to the model it was loaded for. Adapters are
/// owned outside the instance and must outlive any instance they are
/// attached to.
pub struct LoraAdapter {
    model_id: u64,
    handle: u64,
}

impl LoraAdapter {
    pub fn load(model: &Model, path: &Path) -> Result<Self> {
        let handle = model.backend().load_lora(path)?;
        Ok(LoraAdapter {
            model_id: model.backend().model_id(),
            handle,
        })
    }

    /// Identity of the model this adapter belongs to.
    pub fn model_id(&self) -> u64 {
        self.model_id
    }

    pub(crate) fn handle(&self) -> u64 {
        self.handle
    }
}
