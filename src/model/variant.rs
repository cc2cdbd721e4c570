//! Repository variant detection.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Weight flavour shipped by a diffusers-style repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoVariant {
    /// Full-precision weights
    Default,
    /// Half-precision weights (`*.fp16.safetensors`)
    Fp16,
    /// OpenVINO export
    OpenVino,
    /// Flax/JAX weights
    Flax,
    /// ONNX export
    Onnx,
}

impl std::fmt::Display for RepoVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Fp16 => write!(f, "fp16"),
            Self::OpenVino => write!(f, "openvino"),
            Self::Flax => write!(f, "flax"),
            Self::Onnx => write!(f, "onnx"),
        }
    }
}

impl RepoVariant {
    /// Variant suggested by a single file, if any.
    pub(crate) fn from_file(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy();

        // Inner suffixes: `unet.fp16.safetensors` -> ["fp16"].
        let mut parts: Vec<&str> = name.trim_start_matches('.').split('.').skip(1).collect();
        let extension = parts.pop();

        if parts.contains(&"fp16") {
            Some(Self::Fp16)
        } else if name.contains("openvino_model") {
            Some(Self::OpenVino)
        } else if name.contains("flax_model") {
            Some(Self::Flax)
        } else if extension == Some("onnx") {
            Some(Self::Onnx)
        } else {
            None
        }
    }
}
