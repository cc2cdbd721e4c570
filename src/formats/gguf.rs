//! GGUF tensor index reading.
//!
//! Only the header, the metadata key-value section (skipped) and the tensor
//! info table are read; tensor data is never touched.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::formats::{StateDict, TensorEntry};

/// The four-byte magic that every GGUF file starts with.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
/// Minimum supported GGUF version.
pub const GGUF_VERSION_MIN: u32 = 2;
/// Maximum supported GGUF version (inclusive).
pub const GGUF_VERSION_MAX: u32 = 3;

const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;

/// Deepest array-of-arrays nesting accepted in the metadata section.
const MAX_ARRAY_DEPTH: usize = 8;

/// Errors raised while parsing a GGUF header.
#[derive(Error, Debug)]
pub enum GgufError {
    #[error("invalid GGUF magic (expected 'GGUF')")]
    BadMagic,

    #[error("unsupported GGUF version {0} (supported: 2-3)")]
    UnsupportedVersion(u32),

    #[error("file truncated at byte {0}")]
    Truncated(usize),

    #[error("unknown metadata value type {0}")]
    UnknownValueType(u32),

    #[error("string of {len} bytes exceeds limit {limit}")]
    StringTooLong { len: u64, limit: u64 },

    #[error("tensor name is not valid UTF-8")]
    InvalidName,

    #[error("metadata arrays nested deeper than {0} levels")]
    NestingTooDeep(usize),
}

/// Build the tensor index of a `.gguf` file.
pub fn read_tensor_index(path: &Path, max_string_bytes: u64) -> crate::Result<StateDict> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before returning.
    let mmap = unsafe { Mmap::map(&file) }?;
    Ok(parse_tensor_index(&mmap[..], max_string_bytes)?)
}

/// Parse the tensor info table from raw GGUF bytes.
pub fn parse_tensor_index(data: &[u8], max_string_bytes: u64) -> Result<StateDict, GgufError> {
    let mut reader = Reader { data, pos: 0, max_string_bytes };

    if reader.take(4)? != GGUF_MAGIC {
        return Err(GgufError::BadMagic);
    }
    let version = reader.u32()?;
    if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = reader.u64()?;
    let kv_count = reader.u64()?;

    for _ in 0..kv_count {
        reader.skip_string()?;
        let value_type = reader.u32()?;
        reader.skip_value(value_type, 0)?;
    }

    let mut state_dict = StateDict::new();
    for _ in 0..tensor_count {
        let name = reader.string()?;
        let n_dims = reader.u32()?;
        let mut shape = Vec::new();
        for _ in 0..n_dims {
            shape.push(reader.u64()?);
        }
        let ggml_type = reader.u32()?;
        let offset = reader.u64()?;

        // GGUF lists the innermost dimension first.
        shape.reverse();
        let elements = shape.iter().try_fold(1u64, |acc, &dim| acc.checked_mul(dim));
        let (dtype, len) = match ggml_type_layout(ggml_type) {
            Some((label, block_elems, block_bytes)) => (
                label.to_string(),
                elements
                    .and_then(|n| n.checked_div(block_elems))
                    .and_then(|blocks| blocks.checked_mul(block_bytes)),
            ),
            None => (format!("GGML_TYPE_{}", ggml_type), None),
        };

        state_dict.insert(name, TensorEntry { dtype, shape, offset, len });
    }

    Ok(state_dict)
}

/// `(name, elements per block, bytes per block)` of a GGML tensor type.
fn ggml_type_layout(ggml_type: u32) -> Option<(&'static str, u64, u64)> {
    let layout = match ggml_type {
        0 => ("F32", 1, 4),
        1 => ("F16", 1, 2),
        2 => ("Q4_0", 32, 18),
        3 => ("Q4_1", 32, 20),
        6 => ("Q5_0", 32, 22),
        7 => ("Q5_1", 32, 24),
        8 => ("Q8_0", 32, 34),
        9 => ("Q8_1", 32, 36),
        10 => ("Q2_K", 256, 84),
        11 => ("Q3_K", 256, 110),
        12 => ("Q4_K", 256, 144),
        13 => ("Q5_K", 256, 176),
        14 => ("Q6_K", 256, 210),
        15 => ("Q8_K", 256, 292),
        24 => ("I8", 1, 1),
        25 => ("I16", 1, 2),
        26 => ("I32", 1, 4),
        27 => ("I64", 1, 8),
        28 => ("F64", 1, 8),
        30 => ("BF16", 1, 2),
        _ => return None,
    };
    Some(layout)
}

/// Byte width of a fixed-size metadata value type.
fn scalar_width(value_type: u32) -> Option<usize> {
    match value_type {
        0 | 1 | 7 => Some(1),
        2 | 3 => Some(2),
        4 | 5 | 6 => Some(4),
        10..=12 => Some(8),
        _ => None,
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    max_string_bytes: u64,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], GgufError> {
        let end = self.pos.checked_add(n).ok_or(GgufError::Truncated(self.pos))?;
        let bytes = self.data.get(self.pos..end).ok_or(GgufError::Truncated(self.pos))?;
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32, GgufError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, GgufError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn string_bytes(&mut self) -> Result<&'a [u8], GgufError> {
        let len = self.u64()?;
        if len > self.max_string_bytes {
            return Err(GgufError::StringTooLong { len, limit: self.max_string_bytes });
        }
        let len = usize::try_from(len).map_err(|_| GgufError::Truncated(self.pos))?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, GgufError> {
        let bytes = self.string_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| GgufError::InvalidName)
    }

    fn skip_string(&mut self) -> Result<(), GgufError> {
        self.string_bytes().map(|_| ())
    }

    fn skip_value(&mut self, value_type: u32, depth: usize) -> Result<(), GgufError> {
        match value_type {
            TYPE_STRING => self.skip_string(),
            TYPE_ARRAY => {
                if depth >= MAX_ARRAY_DEPTH {
                    return Err(GgufError::NestingTooDeep(MAX_ARRAY_DEPTH));
                }
                let elem_type = self.u32()?;
                let count = self.u64()?;
                if let Some(width) = scalar_width(elem_type) {
                    let total = usize::try_from(count)
                        .ok()
                        .and_then(|c| c.checked_mul(width))
                        .ok_or(GgufError::Truncated(self.pos))?;
                    return self.take(total).map(|_| ());
                }
                for _ in 0..count {
                    self.skip_value(elem_type, depth + 1)?;
                }
                Ok(())
            }
            other => {
                let width = scalar_width(other).ok_or(GgufError::UnknownValueType(other))?;
                self.take(width).map(|_| ())
            }
        }
    }
}
