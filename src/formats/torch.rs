//! Tensor index reading for pickle-based torch checkpoints.
//!
//! Zip archives (`torch.save` since 1.6) go through candle's `.pth` reader.
//! Bare pickle streams are decoded with candle's pickle stack. Either way a
//! nested `state_dict` entry is unwrapped when present, the way training
//! checkpoints store their weights. Only the pickle is read; tensor storage
//! is never touched.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use candle_core::pickle::{read_pth_tensor_info, Object, Stack, TensorInfo};

use crate::error::{Error, Result};
use crate::formats::pickle::ZIP_MAGIC;
use crate::formats::{StateDict, TensorEntry};

/// Key under which training checkpoints nest their weights.
const STATE_DICT_KEY: &str = "state_dict";

/// Build the tensor index of a torch checkpoint.
///
/// Callers are expected to have run the pickle malware scan first.
pub fn read_tensor_index(path: &Path) -> Result<StateDict> {
    let infos = if is_zip_archive(path)? {
        read_archive(path)?
    } else {
        read_bare_pickle(path)?
    };

    Ok(infos
        .iter()
        .map(|info| (info.name.clone(), tensor_entry(info)))
        .collect())
}

fn is_zip_archive(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == ZIP_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_archive(path: &Path) -> Result<Vec<TensorInfo>> {
    match read_pth_tensor_info(path, false, Some(STATE_DICT_KEY)) {
        Ok(infos) if !infos.is_empty() => return Ok(infos),
        Ok(_) => {}
        Err(e) => log::debug!("No {} entry in {:?}: {}", STATE_DICT_KEY, path, e),
    }
    Ok(read_pth_tensor_info(path, false, None)?)
}

fn read_bare_pickle(path: &Path) -> Result<Vec<TensorInfo>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut stack = Stack::empty();
    stack.read_loop(&mut reader)?;

    let entries = match unwrap_state_dict(stack.finalize()?) {
        Object::Dict(entries) => entries,
        _ => {
            return Err(Error::UnsupportedFormat(format!(
                "{} (pickle does not hold a tensor dict)",
                path.display()
            )))
        }
    };

    let mut infos = Vec::new();
    for (name, value) in entries {
        match value.into_tensor_info(name, Path::new("data")) {
            Ok(Some(info)) => infos.push(info),
            Ok(None) => {}
            Err(e) => log::debug!("Skipping entry of {:?}: {}", path, e),
        }
    }
    Ok(infos)
}

/// The `state_dict` value of a checkpoint dict, or the object itself.
fn unwrap_state_dict(object: Object) -> Object {
    let Object::Dict(entries) = object else {
        return object;
    };

    let is_nested = |(key, value): &(Object, Object)| {
        *key == Object::Unicode(STATE_DICT_KEY.to_string()) && matches!(value, Object::Dict(_))
    };
    if !entries.iter().any(is_nested) {
        return Object::Dict(entries);
    }
    entries
        .into_iter()
        .find(is_nested)
        .map(|(_, value)| value)
        .unwrap_or(Object::None)
}

fn tensor_entry(info: &TensorInfo) -> TensorEntry {
    let layout = &info.layout;
    let elem_bytes = info.dtype.size_in_bytes() as u64;
    let len = (layout.shape().elem_count() as u64)
        .checked_mul(elem_bytes)
        .filter(|_| layout.is_contiguous());

    TensorEntry {
        dtype: format!("{:?}", info.dtype),
        shape: layout.dims().iter().map(|&d| d as u64).collect(),
        offset: layout.start_offset() as u64,
        len,
    }
}
