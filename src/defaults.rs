//! Default values for on-disk inspection.

use crate::hash::HashAlgorithm;

/// Extensions (without the dot) recognized as weight files.
pub const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "pt", "pth", "ckpt", "bin", "gguf"];

/// Extensions stripped from a single-file model when deriving its name.
pub const NAME_STEM_EXTENSIONS: &[&str] = &["safetensors", "bin", "pt", "ckpt"];

/// Pickle-based checkpoint extensions.
pub const PICKLE_EXTENSIONS: &[&str] = &["ckpt", "pt", "pth", "bin"];

/// Non-weight files that still contribute to a directory hash.
pub const HASHED_SIDECAR_EXTENSIONS: &[&str] = &["json", "txt", "model"];

/// Diffusers index file looked up at the model root.
pub const MODEL_INDEX_FILE: &str = "model_index.json";

pub const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;
pub const ALLOW_PICKLE: bool = false;

pub fn hash_algorithm() -> HashAlgorithm { HashAlgorithm::Blake3 }
pub fn allow_pickle() -> bool { ALLOW_PICKLE }
pub fn max_header_bytes() -> u64 { MAX_HEADER_BYTES }
