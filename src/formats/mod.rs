//! Tensor index readers for on-disk checkpoint formats.

pub mod gguf;
pub mod pickle;
pub mod safetensors;
pub mod torch;

use std::collections::BTreeMap;

use serde::Serialize;

pub use pickle::{scan_pickle, PickleScan};

/// Location and layout of one tensor inside a weight file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorEntry {
    /// Element type as named by the file format (`F16`, `BF16`, `Q4_K`, ...)
    pub dtype: String,
    /// Dimensions, outermost first
    pub shape: Vec<u64>,
    /// Byte offset from the start of the tensor data section (safetensors,
    /// GGUF) or of the tensor's storage record (torch)
    pub offset: u64,
    /// Byte length, when the element type has a known size
    pub len: Option<u64>,
}

/// Tensors of one weight file keyed by name.
pub type StateDict = BTreeMap<String, TensorEntry>;
