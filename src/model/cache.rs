//! Caller-owned caches shared between [`ModelOnDisk`](crate::ModelOnDisk) views.
//!
//! Both maps are purely additive: entries are never invalidated, so a cache
//! should live no longer than the session that reads a given model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::formats::StateDict;

/// Header metadata of a weight file.
pub type Metadata = HashMap<String, String>;

/// Read-through cache of tensor indexes and header metadata keyed by path.
#[derive(Debug, Default)]
pub struct OnDiskCache {
    state_dicts: RwLock<HashMap<PathBuf, Arc<StateDict>>>,
    metadata: RwLock<HashMap<PathBuf, Arc<Metadata>>>,
}

impl OnDiskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached tensor index for `path`, computing and storing it on a miss.
    pub fn state_dict_or_try_insert_with<E>(
        &self,
        path: &Path,
        compute: impl FnOnce() -> Result<StateDict, E>,
    ) -> Result<Arc<StateDict>, E> {
        get_or_try_compute(&self.state_dicts, path, compute)
    }

    /// Cached metadata for `path`, computing and storing it on a miss.
    pub fn metadata_or_insert_with(
        &self,
        path: &Path,
        compute: impl FnOnce() -> Metadata,
    ) -> Arc<Metadata> {
        let result: Result<_, std::convert::Infallible> =
            get_or_try_compute(&self.metadata, path, || Ok(compute()));
        match result {
            Ok(metadata) => metadata,
            Err(never) => match never {},
        }
    }

    /// Number of cached tensor indexes.
    pub fn state_dict_count(&self) -> usize {
        self.state_dicts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of cached metadata blocks.
    pub fn metadata_count(&self) -> usize {
        self.metadata.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.state_dicts.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.metadata.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

fn get_or_try_compute<V, E>(
    map: &RwLock<HashMap<PathBuf, Arc<V>>>,
    key: &Path,
    compute: impl FnOnce() -> Result<V, E>,
) -> Result<Arc<V>, E> {
    if let Some(hit) = map.read().unwrap_or_else(PoisonError::into_inner).get(key) {
        log::trace!("Cache hit for {:?}", key);
        return Ok(Arc::clone(hit));
    }

    // Computed without holding the lock; the first insert wins a race.
    let value = Arc::new(compute()?);
    let mut guard = map.write().unwrap_or_else(PoisonError::into_inner);
    Ok(Arc::clone(guard.entry(key.to_path_buf()).or_insert(value)))
}
