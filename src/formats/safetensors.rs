//! SafeTensors header reading.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use ::safetensors::tensor::Metadata;
use ::safetensors::SafeTensors;

use crate::error::{Error, Result};
use crate::formats::{StateDict, TensorEntry};

const LEN_PREFIX: usize = 8;

/// Build the tensor index of a `.safetensors` file.
pub fn read_tensor_index(path: &Path, max_header_bytes: u64) -> Result<StateDict> {
    let metadata = read_header(path, max_header_bytes)?;

    let state_dict = metadata
        .tensors()
        .into_iter()
        .map(|(name, info)| {
            let (start, end) = info.data_offsets;
            let entry = TensorEntry {
                dtype: format!("{:?}", info.dtype),
                shape: info.shape.iter().map(|&d| d as u64).collect(),
                offset: start as u64,
                len: Some((end - start) as u64),
            };
            (name, entry)
        })
        .collect();

    Ok(state_dict)
}

/// The `__metadata__` block of a `.safetensors` file.
pub fn read_metadata(path: &Path, max_header_bytes: u64) -> Result<HashMap<String, String>> {
    let metadata = read_header(path, max_header_bytes)?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

fn read_header(path: &Path, max_header_bytes: u64) -> Result<Metadata> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before returning.
    let mmap = unsafe { Mmap::map(&file) }?;

    if let Some(prefix) = mmap.get(..LEN_PREFIX) {
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(prefix);
        let header_len = u64::from_le_bytes(len);
        if header_len > max_header_bytes {
            return Err(Error::HeaderTooLarge {
                path: path.display().to_string(),
                len: header_len,
                limit: max_header_bytes,
            });
        }
    }

    let (_, metadata) = SafeTensors::read_metadata(&mmap[..])?;
    Ok(metadata)
}
