//! Error types for model-on-disk.

use thiserror::Error;

/// model-on-disk error type.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Weight file resolution error
    #[error("Weight file resolution error: {0}")]
    Resolution(#[from] crate::model::resolver::ResolutionError),

    /// SafeTensors header error
    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Torch checkpoint decoding error
    #[error("Torch checkpoint error: {0}")]
    Candle(#[from] candle_core::Error),

    /// GGUF header error
    #[error("GGUF error: {0}")]
    Gguf(#[from] crate::formats::gguf::GgufError),

    /// Pickle checkpoint flagged by the malware scan
    #[error("The model {0} is potentially infected by malware. Aborting import.")]
    UnsafePickle(String),

    /// Pickle checkpoint could not be scanned
    #[error("Error scanning the model at {0} for malware. Aborting import.")]
    PickleScan(String),

    /// Extension has no tensor index reader
    #[error("Unrecognized model extension: {0}")]
    UnsupportedFormat(String),

    /// Header length exceeds the configured cap
    #[error("Header of {path} is {len} bytes (limit {limit})")]
    HeaderTooLarge { path: String, len: u64, limit: u64 },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for model-on-disk operations.
pub type Result<T> = std::result::Result<T, Error>;
