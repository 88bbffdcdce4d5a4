//! Control vectors: per-layer steering directions loaded from GGUF files.
//!
//! Each file carries tensors named `direction.<layer>` (layer >= 1), all 1-D
//! F32 with one shared embedding width. A file scales every direction by its
//! `strength`; multiple files sum element-wise. Any malformed tensor
//! invalidates the result — the caller continues without steering, it does
//! not abort.

use std::path::PathBuf;

use blama_gguf::GgufFile;

use crate::model::Model;

/// One source file and its scaling factor.
#[derive(Debug, Clone)]
pub struct ControlVectorLoadInfo {
    pub path: PathBuf,
    pub strength: f32,
}

/// Summed per-layer steering data, laid out as `n_embd` floats per layer
/// with layer 1 at offset 0 (layer 0 carries no direction).
pub struct ControlVector {
    pub data: Vec<f32>,
    /// Shared embedding width, or -1 when loading failed.
    pub n_embd: i32,
    pub layer_start: u32,
    pub layer_end: u32,
}

struct LoadResult {
    n_embd: i32,
    data: Vec<f32>,
}

fn load_one(gguf: &GgufFile, origin: &str, strength: f32) -> LoadResult {
    let mut result = LoadResult {
        n_embd: -1,
        data: Vec::new(),
    };

    if gguf.tensors().is_empty() {
        tracing::warn!("no direction tensors found in {origin}");
    }

    for info in gguf.tensors() {
        let layer_idx = info
            .name
            .strip_prefix("direction.")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1);
        if layer_idx <= 0 {
            tracing::error!(
                "invalid{} direction tensor layer index in {origin}",
                if layer_idx == 0 { " (zero)" } else { "" }
            );
            result.n_embd = -1;
            break;
        }

        if info.n_dims() != 1 {
            tracing::error!("invalid (non-1D) direction tensor shape in {origin}");
            result.n_embd = -1;
            break;
        }

        let values = match gguf.tensor_f32(info) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!("invalid direction tensor in {origin}: {err}");
                result.n_embd = -1;
                break;
            }
        };

        if result.n_embd == -1 {
            result.n_embd = values.len() as i32;
        } else if values.len() as i32 != result.n_embd {
            tracing::error!("direction tensor in {origin} does not match previous dimensions");
            result.n_embd = -1;
            break;
        }

        // zero-extend first, then add; layer 1 lives at offset 0 and several
        // directions may target the same layer within one file
        let needed = result.n_embd as usize * layer_idx as usize;
        if result.data.len() < needed {
            result.data.resize(needed, 0.0);
        }
        let row = (layer_idx as usize - 1) * result.n_embd as usize;
        for (dst, src) in result.data[row..row + result.n_embd as usize]
            .iter_mut()
            .zip(&values)
        {
            *dst += src * strength;
        }
    }

    if result.n_embd == -1 {
        tracing::warn!("skipping {origin} due to invalid direction tensors");
        result.data.clear();
    }

    result
}

impl ControlVector {
    /// Load and sum a set of control-vector files. Layer selectors of `0`
    /// mean "default": layer 1 through the model's layer count.
    pub fn load(model: &Model, infos: &[ControlVectorLoadInfo], layer_start: u32, layer_end: u32) -> Self {
        let mut out = ControlVector {
            data: Vec::new(),
            n_embd: -1,
            layer_start: if layer_start == 0 { 1 } else { layer_start },
            layer_end: if layer_end == 0 {
                model.n_layer()
            } else {
                layer_end
            },
        };

        for info in infos {
            let origin = info.path.display().to_string();
            let cur = match GgufFile::open(&info.path) {
                Ok(gguf) => load_one(&gguf, &origin, info.strength),
                Err(err) => {
                    tracing::error!("failed to load control vector file from {origin}: {err}");
                    LoadResult {
                        n_embd: -1,
                        data: Vec::new(),
                    }
                }
            };

            if cur.n_embd == -1 {
                out.n_embd = -1;
                break;
            }
            if out.n_embd != -1 && out.n_embd != cur.n_embd {
                tracing::error!("control vectors in {origin} do not match previous dimensions");
                out.n_embd = -1;
                break;
            }

            if out.n_embd == -1 {
                out.n_embd = cur.n_embd;
                out.data = cur.data;
            } else {
                if out.data.len() < cur.data.len() {
                    out.data.resize(cur.data.len(), 0.0);
                }
                for (dst, src) in out.data.iter_mut().zip(&cur.data) {
                    *dst += src;
                }
            }
        }

        if out.n_embd == -1 {
            tracing::error!("no valid control vector files passed");
            out.data.clear();
        }

        out
    }

    /// Whether anything usable was loaded.
    pub fn is_valid(&self) -> bool {
        self.n_embd > 0 && !self.data.is_empty()
    }
}
