//! Checkpoint I/O in the safetensors format.
//!
//! Tensors are written as little-endian f32. Reading also accepts f16 and bf16
//! payloads and widens them to f32.

use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::{serialize, TensorView};
use safetensors::{Dtype, SafeTensors};
use tracing::debug;
use varformer_core::{Result, Tensor, VarError};

use crate::module::Module;

/// Serialize a state dict to safetensors bytes.
pub fn state_dict_to_bytes(state_dict: &HashMap<String, Tensor>) -> Result<Vec<u8>> {
    let mut names: Vec<&String> = state_dict.keys().collect();
    names.sort();

    let buffers: Vec<(&str, Vec<u8>, Vec<usize>)> = names
        .iter()
        .map(|name| {
            let t = &state_dict[*name];
            let bytes = t.as_f32_slice().iter().flat_map(|f| f.to_le_bytes()).collect();
            (name.as_str(), bytes, t.dims().to_vec())
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, bytes, shape) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| VarError::Serialization(format!("tensor `{name}`: {e}")))?;
        views.push((*name, view));
    }

    serialize(views, &None).map_err(|e| VarError::Serialization(e.to_string()))
}

/// Parse safetensors bytes into a state dict.
pub fn state_dict_from_bytes(data: &[u8]) -> Result<HashMap<String, Tensor>> {
    let tensors = SafeTensors::deserialize(data).map_err(|e| VarError::Serialization(e.to_string()))?;
    let mut out = HashMap::new();
    for (name, view) in tensors.tensors() {
        let tensor = view_to_tensor(&name, &view)?;
        out.insert(name, tensor);
    }
    Ok(out)
}

pub fn save_state_dict(state_dict: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let bytes = state_dict_to_bytes(state_dict)?;
    std::fs::write(path, bytes)?;
    debug!(path = %path.display(), tensors = state_dict.len(), "saved state dict");
    Ok(())
}

pub fn load_state_dict(path: &Path) -> Result<HashMap<String, Tensor>> {
    let data = std::fs::read(path)?;
    let state = state_dict_from_bytes(&data)?;
    debug!(path = %path.display(), tensors = state.len(), "loaded state dict");
    Ok(state)
}

/// Save every named parameter of `module`.
pub fn save_module(module: &dyn Module, path: &Path) -> Result<()> {
    save_state_dict(&module.state_dict(), path)
}

fn view_to_tensor(name: &str, view: &TensorView<'_>) -> Result<Tensor> {
    let data = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => {
            return Err(VarError::Serialization(format!(
                "tensor `{name}` has unsupported dtype {other:?}"
            )))
        }
    };
    Tensor::from_vec(values, view.shape())
}
