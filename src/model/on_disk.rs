//! A model stored on disk.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::config::OnDiskConfig;
use crate::defaults::{NAME_STEM_EXTENSIONS, PICKLE_EXTENSIONS};
use crate::error::{Error, Result};
use crate::formats::{self, StateDict};
use crate::hash::ModelHash;
use crate::model::cache::{Metadata, OnDiskCache};
use crate::model::resolver::WeightFileResolver;
use crate::model::variant::RepoVariant;

/// Extensions scanned for [`ModelOnDisk::repo_variant`], in scan order.
const VARIANT_SCAN_EXTENSIONS: [&str; 3] = ["safetensors", "bin", "onnx"];

/// A model file or directory, with cached views of its weights.
///
/// Views created with [`with_cache`](Self::with_cache) over the same
/// [`OnDiskCache`] share parsed tensor indexes and metadata.
#[derive(Debug, Clone)]
pub struct ModelOnDisk {
    path: PathBuf,
    name: String,
    config: OnDiskConfig,
    cache: Arc<OnDiskCache>,
    resolver: WeightFileResolver,
}

impl ModelOnDisk {
    /// Inspect the model at `path` with default settings and a private cache.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, OnDiskConfig::default())
    }

    pub fn with_config(path: impl Into<PathBuf>, config: OnDiskConfig) -> Self {
        Self::with_cache(path, config, Arc::new(OnDiskCache::new()))
    }

    /// Inspect the model at `path`, sharing `cache` with other views.
    pub fn with_cache(path: impl Into<PathBuf>, config: OnDiskConfig, cache: Arc<OnDiskCache>) -> Self {
        let path = path.into();
        let name = model_name(&path);
        Self {
            resolver: WeightFileResolver::new(path.clone()),
            path,
            name,
            config,
            cache,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem for single-file checkpoints, otherwise the file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &OnDiskConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<OnDiskCache> {
        &self.cache
    }

    /// Content hash of the model using the configured algorithm.
    pub fn hash(&self) -> Result<String> {
        ModelHash::new(self.config.hash_algorithm).hash(&self.path)
    }

    /// Size in bytes of the file, or of every file under the directory.
    pub fn size(&self) -> Result<u64> {
        if self.path.is_file() {
            return Ok(std::fs::metadata(&self.path)?.len());
        }

        let mut total = 0;
        for entry in WalkDir::new(&self.path).follow_links(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(std::io::Error::from)?.len();
            }
        }
        Ok(total)
    }

    /// Every weight file of the model.
    pub fn weight_files(&self) -> Result<BTreeSet<PathBuf>> {
        Ok(self.resolver.weight_files()?)
    }

    /// The weight file to load, or `explicit` when given.
    pub fn resolve_weight_file(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        Ok(self.resolver.resolve(explicit)?)
    }

    /// Weight flavour of a diffusers-style directory; `None` for a file.
    pub fn repo_variant(&self) -> Result<Option<RepoVariant>> {
        if self.path.is_file() {
            return Ok(None);
        }

        let mut by_extension: [Vec<PathBuf>; 3] = Default::default();
        for entry in WalkDir::new(&self.path).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let ext = entry.path().extension().and_then(OsStr::to_str);
            if let Some(slot) = VARIANT_SCAN_EXTENSIONS.iter().position(|e| Some(*e) == ext) {
                by_extension[slot].push(entry.into_path());
            }
        }

        let variant = by_extension
            .iter()
            .flatten()
            .find_map(|path| RepoVariant::from_file(path))
            .unwrap_or(RepoVariant::Default);
        Ok(Some(variant))
    }

    /// Header metadata of a safetensors file (the model path by default).
    ///
    /// Unreadable files and other formats yield an empty map.
    pub fn metadata(&self, path: Option<&Path>) -> Arc<Metadata> {
        let path = path.unwrap_or(&self.path);
        self.cache.metadata_or_insert_with(path, || {
            formats::safetensors::read_metadata(path, self.config.max_header_bytes).unwrap_or_else(|e| {
                log::debug!("No safetensors metadata for {:?}: {}", path, e);
                Metadata::new()
            })
        })
    }

    /// Tensor index of the resolved weight file.
    pub fn load_state_dict(&self, path: Option<&Path>) -> Result<Arc<StateDict>> {
        let path = self.resolve_weight_file(path)?;
        self.cache
            .state_dict_or_try_insert_with(&path, || self.read_state_dict(&path))
    }

    /// Refuse pickle checkpoints the malware scan flags or cannot scan,
    /// unless `allow_pickle` is set.
    pub fn check_pickle_safety(&self, path: &Path) -> Result<()> {
        let scan = formats::scan_pickle(path)?;
        let stem = file_stem(path);

        if scan.is_infected() {
            if !self.config.allow_pickle {
                return Err(Error::UnsafePickle(stem));
            }
            log::warn!(
                "The model {} is potentially infected by malware ({}), but pickle scanning is overridden. Proceeding with caution.",
                stem,
                scan.dangerous_globals.join(", ")
            );
        }

        if scan.scan_error {
            if !self.config.allow_pickle {
                return Err(Error::PickleScan(stem));
            }
            log::warn!(
                "Error scanning the model at {} for malware, but pickle scanning is overridden. Proceeding with caution.",
                stem
            );
        }

        Ok(())
    }

    fn read_state_dict(&self, path: &Path) -> Result<StateDict> {
        let ext = path.extension().and_then(OsStr::to_str).unwrap_or_default();
        let limit = self.config.max_header_bytes;

        match ext {
            "safetensors" => formats::safetensors::read_tensor_index(path, limit),
            "gguf" => formats::gguf::read_tensor_index(path, limit),
            _ if PICKLE_EXTENSIONS.contains(&ext) => {
                self.check_pickle_safety(path)?;
                formats::torch::read_tensor_index(path)
            }
            _ => Err(Error::UnsupportedFormat(format!(".{}", ext))),
        }
    }
}

fn model_name(path: &Path) -> String {
    let is_checkpoint = path
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| NAME_STEM_EXTENSIONS.contains(&ext));

    let name = if is_checkpoint { path.file_stem() } else { path.file_name() };
    name.map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
