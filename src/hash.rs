//! Content hashing of model files and directories.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::defaults::{HASHED_SIDECAR_EXTENSIONS, WEIGHT_EXTENSIONS};
use crate::error::{Error, Result};

const READ_CHUNK: usize = 1 << 20;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3 => write!(f, "blake3"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blake3" | "blake3_single" => Ok(Self::Blake3),
            "sha256" => Ok(Self::Sha256),
            other => Err(Error::Config(format!("unknown hash algorithm '{}'", other))),
        }
    }
}

enum Hasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Blake3(h) => {
                h.update(bytes);
            }
            Self::Sha256(h) => h.update(bytes),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Blake3(h) => h.finalize().as_bytes().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Hashes a model file, or the model files of a directory.
#[derive(Debug, Clone, Copy)]
pub struct ModelHash {
    algorithm: HashAlgorithm,
}

impl ModelHash {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Hash `path` into `"<algorithm>:<hex digest>"`.
    ///
    /// A directory hash digests the per-file digests of its weight and
    /// sidecar files in relative-path order.
    pub fn hash(&self, path: &Path) -> Result<String> {
        let digest = if path.is_file() {
            self.hash_file(path)?
        } else {
            self.hash_dir(path)?
        };
        Ok(format!("{}:{}", self.algorithm, hex::encode(digest)))
    }

    fn hash_file(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = BufReader::with_capacity(READ_CHUNK, File::open(path)?);
        let mut hasher = Hasher::new(self.algorithm);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    fn hash_dir(&self, root: &Path) -> Result<Vec<u8>> {
        let mut combined = Hasher::new(self.algorithm);
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() && is_hashed(entry.path()) {
                log::trace!("Hashing {:?}", entry.path());
                combined.update(&self.hash_file(entry.path())?);
            }
        }
        Ok(combined.finalize())
    }
}

fn is_hashed(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            WEIGHT_EXTENSIONS.contains(&ext) || HASHED_SIDECAR_EXTENSIONS.contains(&ext)
        })
}
