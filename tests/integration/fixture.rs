//! On-disk model directories for integration tests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub(crate) struct ModelDir {
    dir: TempDir,
}

impl ModelDir {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `bytes` at `rel`, creating parent directories.
    pub(crate) fn write(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, bytes).expect("Failed to write fixture file");
        path
    }

    /// Write a placeholder weight file.
    pub(crate) fn touch(&self, rel: &str) -> PathBuf {
        self.write(rel, b"weights")
    }

    pub(crate) fn write_index(&self, index: &serde_json::Value) {
        self.write("model_index.json", index.to_string().as_bytes());
    }

    /// Write a valid safetensors file with one F16 tensor and optional metadata.
    pub(crate) fn write_safetensors(&self, rel: &str, metadata: &[(&str, &str)]) -> PathBuf {
        let mut header = serde_json::json!({
            "conv_in.weight": {"dtype": "F16", "shape": [4, 2], "data_offsets": [0, 16]}
        });
        if !metadata.is_empty() {
            let block: serde_json::Map<String, serde_json::Value> = metadata
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
                .collect();
            header["__metadata__"] = serde_json::Value::Object(block);
        }

        let mut header_bytes = serde_json::to_vec(&header).unwrap();
        while header_bytes.len() % 8 != 0 {
            header_bytes.push(b' ');
        }
        let mut bytes = (header_bytes.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header_bytes);
        bytes.extend_from_slice(&[0u8; 16]);
        self.write(rel, &bytes)
    }

    /// Write a GGUF v3 file with one F16 tensor and no metadata.
    pub(crate) fn write_gguf(&self, rel: &str) -> PathBuf {
        let name = "token_embd.weight";
        let mut d = Vec::new();
        d.extend_from_slice(b"GGUF");
        d.extend_from_slice(&3u32.to_le_bytes());
        d.extend_from_slice(&1u64.to_le_bytes());
        d.extend_from_slice(&0u64.to_le_bytes());
        d.extend_from_slice(&(name.len() as u64).to_le_bytes());
        d.extend_from_slice(name.as_bytes());
        d.extend_from_slice(&2u32.to_le_bytes());
        d.extend_from_slice(&8u64.to_le_bytes());
        d.extend_from_slice(&3u64.to_le_bytes());
        d.extend_from_slice(&1u32.to_le_bytes()); // F16
        d.extend_from_slice(&0u64.to_le_bytes());
        self.write(rel, &d)
    }

    /// Write a zip-format torch checkpoint holding
    /// `{"epoch": 1, "state_dict": {"weight": <f32 tensor of shape [2, 3]>}}`.
    pub(crate) fn write_torch_checkpoint(&self, rel: &str) -> PathBuf {
        let mut pickle = b"\x80\x02}".to_vec();
        pickle.extend_from_slice(b"X\x05\x00\x00\x00epochK\x01s");
        pickle.extend_from_slice(b"X\x0a\x00\x00\x00state_dict}");
        pickle.extend_from_slice(b"X\x06\x00\x00\x00weight");
        pickle.extend_from_slice(b"ctorch._utils\n_rebuild_tensor_v2\n((");
        pickle.extend_from_slice(b"X\x07\x00\x00\x00storagectorch\nFloatStorage\n");
        pickle.extend_from_slice(b"X\x01\x00\x00\x000X\x03\x00\x00\x00cpuK\x06tQ");
        pickle.extend_from_slice(b"K\x00(K\x02K\x03t(K\x03K\x01t\x89}tRss.");

        let path = self.write(rel, b"");
        let file = fs::File::create(&path).expect("Failed to create checkpoint");
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("archive/data.pkl", options).expect("Failed to start data.pkl");
        zip.write_all(&pickle).expect("Failed to write data.pkl");
        zip.start_file("archive/data/0", options).expect("Failed to start storage");
        zip.write_all(&[0u8; 24]).expect("Failed to write storage");
        zip.finish().expect("Failed to finish checkpoint");
        path
    }
}
