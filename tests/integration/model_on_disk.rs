//! ModelOnDisk against fabricated checkpoints.

use std::sync::Arc;

use model_on_disk::{Error, HashAlgorithm, ModelOnDisk, OnDiskCache, OnDiskConfig, RepoVariant};

use crate::fixture::ModelDir;

#[test]
fn test_load_state_dict_from_resolved_safetensors() {
    let model = ModelDir::new();
    model.write_safetensors("unet/diffusion_pytorch_model.safetensors", &[]);
    model.write_safetensors("vae/diffusion_pytorch_model.safetensors", &[]);

    let on_disk = ModelOnDisk::new(model.root());
    let state_dict = on_disk.load_state_dict(None).unwrap();

    let conv = &state_dict["conv_in.weight"];
    assert_eq!(conv.dtype, "F16");
    assert_eq!(conv.shape, vec![4, 2]);
    assert_eq!(conv.len, Some(16));
    assert_eq!(on_disk.cache().state_dict_count(), 1);
}

#[test]
fn test_load_state_dict_from_gguf_file() {
    let model = ModelDir::new();
    let path = model.write_gguf("flux1-dev-Q8_0.gguf");

    let on_disk = ModelOnDisk::new(&path);
    assert_eq!(on_disk.name(), "flux1-dev-Q8_0.gguf");

    let state_dict = on_disk.load_state_dict(None).unwrap();
    let embd = &state_dict["token_embd.weight"];
    assert_eq!(embd.dtype, "F16");
    assert_eq!(embd.shape, vec![3, 8]);
    assert_eq!(embd.len, Some(48));
}

#[test]
fn test_shared_cache_across_views() {
    let model = ModelDir::new();
    let path = model.write_safetensors("model.safetensors", &[("format", "pt")]);
    let cache = Arc::new(OnDiskCache::new());

    let first = ModelOnDisk::with_cache(&path, OnDiskConfig::default(), Arc::clone(&cache));
    let second = ModelOnDisk::with_cache(&path, OnDiskConfig::default(), Arc::clone(&cache));

    let a = first.load_state_dict(None).unwrap();
    let b = second.load_state_dict(None).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.state_dict_count(), 1);

    assert_eq!(second.metadata(None).get("format").map(String::as_str), Some("pt"));
    assert_eq!(cache.metadata_count(), 1);
}

#[test]
fn test_metadata_of_non_safetensors_is_empty() {
    let model = ModelDir::new();
    let path = model.touch("model.ckpt");
    assert!(ModelOnDisk::new(&path).metadata(None).is_empty());
}

#[test]
fn test_malicious_pickle_rejected() {
    let model = ModelDir::new();
    let path = model.write("model.ckpt", b"\x80\x02cposix\nsystem\nq\x00X\x02\x00\x00\x00lsq\x01\x85q\x02Rq\x03.");

    let err = ModelOnDisk::new(&path).load_state_dict(None).unwrap_err();
    match err {
        Error::UnsafePickle(stem) => assert_eq!(stem, "model"),
        other => panic!("expected UnsafePickle, got {:?}", other),
    }
}

#[test]
fn test_unscannable_pickle_rejected() {
    let model = ModelDir::new();
    let path = model.write("model.pt", b"not a pickle");

    let err = ModelOnDisk::new(&path).load_state_dict(None).unwrap_err();
    assert!(matches!(err, Error::PickleScan(_)));
}

#[test]
fn test_allow_pickle_passes_scan() {
    let model = ModelDir::new();
    let path = model.write("model.pt", b"not a pickle");
    let config = OnDiskConfig { allow_pickle: true, ..OnDiskConfig::default() };

    let on_disk = ModelOnDisk::with_config(&path, config);
    assert!(on_disk.check_pickle_safety(&path).is_ok());
    // The scan is overridden, so the failure comes from decoding.
    assert!(matches!(on_disk.load_state_dict(None).unwrap_err(), Error::Candle(_)));
}

#[test]
fn test_load_state_dict_from_torch_checkpoint() {
    let model = ModelDir::new();
    model.write_torch_checkpoint("sd15.ckpt");

    let on_disk = ModelOnDisk::new(model.root());
    let state_dict = on_disk.load_state_dict(None).unwrap();
    assert_eq!(state_dict.len(), 1);

    let weight = &state_dict["weight"];
    assert_eq!(weight.dtype, "F32");
    assert_eq!(weight.shape, vec![2, 3]);
    assert_eq!(weight.offset, 0);
    assert_eq!(weight.len, Some(24));
}

#[test]
fn test_load_state_dict_from_bare_pickle() {
    let model = ModelDir::new();
    model.write("pytorch_model.bin", b"\x80\x02}q\x00.");

    let state_dict = ModelOnDisk::new(model.root()).load_state_dict(None).unwrap();
    assert!(state_dict.is_empty());
}

#[test]
fn test_stack_global_pickle_rejected() {
    let model = ModelDir::new();
    let path = model.write(
        "model.pt",
        b"\x80\x04X\x02\x00\x00\x00os\x94X\x06\x00\x00\x00system\x94\x93\x94.",
    );

    let err = ModelOnDisk::new(&path).load_state_dict(None).unwrap_err();
    assert!(matches!(err, Error::UnsafePickle(_)));
}

#[test]
fn test_explicit_path_bypasses_resolution() {
    let model = ModelDir::new();
    model.write_safetensors("unet/diffusion_pytorch_model.safetensors", &[]);
    let vae = model.write_safetensors("vae/diffusion_pytorch_model.safetensors", &[("component", "vae")]);

    let on_disk = ModelOnDisk::new(model.root());
    assert_eq!(on_disk.resolve_weight_file(Some(vae.as_path())).unwrap(), vae);
    assert_eq!(on_disk.metadata(Some(vae.as_path())).get("component").map(String::as_str), Some("vae"));
    assert!(on_disk.load_state_dict(Some(vae.as_path())).is_ok());
}

#[test]
fn test_directory_summary() {
    let model = ModelDir::new();
    model.touch("unet/diffusion_pytorch_model.fp16.safetensors");
    model.touch("text_encoder/model.fp16.safetensors");
    model.write("model_index.json", b"{}");

    let on_disk = ModelOnDisk::with_config(
        model.root(),
        OnDiskConfig { hash_algorithm: HashAlgorithm::Sha256, ..OnDiskConfig::default() },
    );
    assert_eq!(on_disk.weight_files().unwrap().len(), 2);
    assert_eq!(on_disk.repo_variant().unwrap(), Some(RepoVariant::Fp16));
    assert_eq!(on_disk.size().unwrap(), 7 + 7 + 2);

    let hash = on_disk.hash().unwrap();
    assert!(hash.starts_with("sha256:"));
    assert_eq!(hash.len(), "sha256:".len() + 64);
    assert_eq!(on_disk.hash().unwrap(), hash);
}
