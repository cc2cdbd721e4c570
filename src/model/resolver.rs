//! Weight file resolution utilities.
//!
//! A model root may ship several weight files (UNet and VAE shards, LoRA
//! adapters, quantized variants). [`WeightFileResolver`] picks exactly one
//! of them, always the same one for the same directory contents:
//!
//! 1. the file referenced most often by the weight maps in `model_index.json`
//! 2. the best match against common diffusers / transformers file names
//! 3. the lexicographically first candidate

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use walkdir::WalkDir;

use crate::defaults::{MODEL_INDEX_FILE, WEIGHT_EXTENSIONS};

const WEIGHT_MAP_KEYS: [&str; 2] = ["weight_map", "_weight_map"];
const LOWEST_PRIORITY: u32 = 100;

/// Errors raised while resolving a weight file.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// The model root contains no recognized weight file
    #[error("No weight files found for model at {}", .0.display())]
    NoWeightFilesFound(PathBuf),

    /// Enumerating the model root failed
    #[error("Failed to enumerate {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Picks the canonical weight file of a model root.
#[derive(Debug, Clone)]
pub struct WeightFileResolver {
    root: PathBuf,
}

impl WeightFileResolver {
    /// Create a resolver for a model root (file or directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The model root this resolver inspects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the weight file to load.
    ///
    /// An explicit path is returned unchanged. Otherwise the weight files
    /// under the root are enumerated and one is selected; only an empty
    /// candidate set is an error.
    pub fn resolve(&self, explicit: Option<&Path>) -> Result<PathBuf, ResolutionError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let candidates = self.weight_files()?;
        let Some(first) = candidates.first().cloned() else {
            return Err(ResolutionError::NoWeightFilesFound(self.root.clone()));
        };
        if candidates.len() == 1 {
            return Ok(first);
        }

        let chosen = self
            .select_from_index(&candidates)
            .or_else(|| self.select_by_name(&candidates));
        debug_assert!(chosen.is_some(), "select_by_name scores every candidate");

        Ok(chosen.unwrap_or(first))
    }

    /// Enumerate every weight file under the root.
    ///
    /// A file root is its own only candidate, whatever its extension.
    pub fn weight_files(&self) -> Result<BTreeSet<PathBuf>, ResolutionError> {
        if self.root.is_file() {
            return Ok(BTreeSet::from([self.root.clone()]));
        }

        let mut files = BTreeSet::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|e| ResolutionError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                source: e.into(),
            })?;
            if entry.file_type().is_file() && is_weight_file(entry.path()) {
                files.insert(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Use the weight maps of `model_index.json` to pick the primary file.
    ///
    /// The file referenced by the most tensors wins (typically the UNet).
    /// A missing, unreadable or malformed index yields `None`.
    pub fn select_from_index(&self, candidates: &BTreeSet<PathBuf>) -> Option<PathBuf> {
        if candidates.is_empty() || self.root.is_file() {
            return None;
        }

        let index_path = self.root.join(MODEL_INDEX_FILE);
        if !index_path.exists() {
            return None;
        }

        let index: Value = match std::fs::read_to_string(&index_path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
        {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Ignoring unreadable {:?}: {}", index_path, e);
                return None;
            }
        };

        let mut weight_maps = Vec::new();
        collect_weight_maps(&index, &mut weight_maps);
        if weight_maps.is_empty() {
            return None;
        }

        let keyed: BTreeMap<String, &PathBuf> = candidates
            .iter()
            .map(|path| (self.relative_key(path), path))
            .collect();

        let mut frequency: HashMap<&str, usize> = HashMap::new();
        for weight_map in weight_maps {
            for value in weight_map.values() {
                let Some(rel_path) = value.as_str() else {
                    continue;
                };
                let normalized = normalize_index_path(rel_path);
                if let Some((key, _)) = keyed.get_key_value(normalized.as_str()) {
                    *frequency.entry(key.as_str()).or_insert(0) += 1;
                }
            }
        }

        let max_count = frequency.values().copied().max()?;
        let best = frequency
            .iter()
            .filter(|(_, count)| **count == max_count)
            .map(|(key, _)| *key)
            .min()?;

        log::debug!(
            "Selected {} from {} ({} weight map references)",
            best,
            MODEL_INDEX_FILE,
            max_count
        );
        keyed.get(best).map(|path| (*path).clone())
    }

    /// Choose a reasonable default weight file from common naming patterns.
    ///
    /// Deterministic rather than perfect: callers needing a specific file
    /// pass it explicitly to [`resolve`](Self::resolve).
    pub fn select_by_name(&self, candidates: &BTreeSet<PathBuf>) -> Option<PathBuf> {
        let best = candidates
            .iter()
            .map(|path| {
                let normalized = self.relative_key(path).to_lowercase();
                (name_priority(&normalized), normalized, path)
            })
            .min_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)))?;

        log::debug!("Selected {} by file name (priority {})", best.1, best.0);
        Some(best.2.clone())
    }

    /// Forward-slash path of `path` relative to the root, or its file name
    /// when it lies outside the root.
    fn relative_key(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => to_forward_slash(rel),
            _ => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| to_forward_slash(path)),
        }
    }
}

/// Whether `path` carries one of the recognized weight extensions.
pub fn is_weight_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| WEIGHT_EXTENSIONS.contains(&ext))
}

/// Lower is better.
fn name_priority(normalized: &str) -> u32 {
    if normalized.contains("unet") && normalized.contains("diffusion_pytorch_model") {
        0
    } else if normalized.contains("diffusion_pytorch_model") {
        1
    } else if normalized.ends_with("model.safetensors") || normalized.ends_with("model.bin") {
        2
    } else if normalized.contains("pytorch_model") {
        3
    } else if normalized.contains("pytorch_lora_weights") {
        4
    } else if normalized.contains("lora") {
        5
    } else {
        LOWEST_PRIORITY
    }
}

fn collect_weight_maps<'a>(node: &'a Value, acc: &mut Vec<&'a Map<String, Value>>) {
    match node {
        Value::Object(map) => {
            for key in WEIGHT_MAP_KEYS {
                if let Some(Value::Object(weight_map)) = map.get(key) {
                    acc.push(weight_map);
                }
            }
            for value in map.values() {
                collect_weight_maps(value, acc);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_weight_maps(item, acc);
            }
        }
        _ => {}
    }
}

/// Normalize an index entry to a forward-slash relative path.
///
/// Backslashes become separators, empty and `.` segments are dropped.
fn normalize_index_path(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let joined = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");
    if unified.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

fn to_forward_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
