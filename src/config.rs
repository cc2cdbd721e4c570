//! Configuration for on-disk model inspection.

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

const ENV_HASH_ALGO: &str = "MODEL_ON_DISK_HASH_ALGO";
const ENV_ALLOW_PICKLE: &str = "MODEL_ON_DISK_ALLOW_PICKLE";

/// Settings shared by every [`ModelOnDisk`](crate::ModelOnDisk) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDiskConfig {
    /// Digest used by `hash()`.
    #[serde(default = "defaults::hash_algorithm")]
    pub hash_algorithm: HashAlgorithm,
    /// Proceed with pickle checkpoints the malware scan flagged or failed on.
    #[serde(default = "defaults::allow_pickle")]
    pub allow_pickle: bool,
    /// Upper bound on a safetensors header or GGUF string read.
    #[serde(default = "defaults::max_header_bytes")]
    pub max_header_bytes: u64,
}

impl Default for OnDiskConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: defaults::hash_algorithm(),
            allow_pickle: defaults::allow_pickle(),
            max_header_bytes: defaults::max_header_bytes(),
        }
    }
}

impl OnDiskConfig {
    /// Defaults overridden by `MODEL_ON_DISK_HASH_ALGO` and
    /// `MODEL_ON_DISK_ALLOW_PICKLE` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(algo) = lookup(ENV_HASH_ALGO) {
            config.hash_algorithm = algo.parse()?;
        }

        if let Some(raw) = lookup(ENV_ALLOW_PICKLE) {
            config.allow_pickle = parse_flag(&raw).ok_or_else(|| {
                Error::Config(format!("{} must be a boolean, got '{}'", ENV_ALLOW_PICKLE, raw))
            })?;
        }

        Ok(config)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
