//! model-on-disk - inspect models stored on disk.
//!
//! Picks the canonical weight file of a model directory, indexes the tensors
//! of safetensors, GGUF and torch checkpoints, reads header metadata, screens
//! pickle checkpoints for malware, and hashes model contents.

mod defaults;
pub mod error;

pub mod config;
pub mod formats;
pub mod hash;
pub mod model;

pub use error::{Error, Result};

pub use config::OnDiskConfig;
pub use formats::{scan_pickle, PickleScan, StateDict, TensorEntry};
pub use hash::{HashAlgorithm, ModelHash};
pub use model::cache::{Metadata, OnDiskCache};
pub use model::on_disk::ModelOnDisk;
pub use model::resolver::{ResolutionError, WeightFileResolver};
pub use model::variant::RepoVariant;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
