//! Weight file resolution against fabricated model directories.

use model_on_disk::{ModelOnDisk, ResolutionError, WeightFileResolver};
use serde_json::json;

use crate::fixture::ModelDir;

#[test]
fn test_single_weight_file_wins_regardless_of_index() {
    let model = ModelDir::new();
    let only = model.touch("transformer/model.gguf");
    model.touch("config.json");
    model.write_index(&json!({"weight_map": {"x": "other.safetensors", "y": "other.safetensors"}}));

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), only);
}

#[test]
fn test_no_weight_files() {
    let model = ModelDir::new();
    model.touch("config.json");
    model.touch("model.onnx");

    let resolver = WeightFileResolver::new(model.root());
    match resolver.resolve(None) {
        Err(ResolutionError::NoWeightFilesFound(root)) => assert_eq!(root, model.root()),
        other => panic!("expected NoWeightFilesFound, got {:?}", other),
    }
}

#[test]
fn test_no_weight_files_through_model_on_disk() {
    let model = ModelDir::new();
    let err = ModelOnDisk::new(model.root()).resolve_weight_file(None).unwrap_err();
    assert!(matches!(
        err,
        model_on_disk::Error::Resolution(ResolutionError::NoWeightFilesFound(_))
    ));
}

#[test]
fn test_unet_preferred_without_index() {
    let model = ModelDir::new();
    let unet = model.touch("unet/diffusion_pytorch_model.safetensors");
    model.touch("vae/diffusion_pytorch_model.safetensors");

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), unet);
}

#[test]
fn test_index_frequency_selects_most_referenced() {
    let model = ModelDir::new();
    model.touch("a.safetensors");
    let b = model.touch("b.safetensors");
    model.write_index(&json!({
        "weight_map": {
            "t0": "a.safetensors",
            "t1": "b.safetensors",
            "t2": "b.safetensors"
        },
        "text_encoder": {"_weight_map": {"t3": "b.safetensors"}}
    }));

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), b);
}

#[test]
fn test_index_overrides_naming_heuristic() {
    let model = ModelDir::new();
    model.touch("unet/diffusion_pytorch_model.safetensors");
    let vae = model.touch("vae/diffusion_pytorch_model.safetensors");
    model.write_index(&json!({
        "components": [{"weight_map": {"decoder.conv": "vae/diffusion_pytorch_model.safetensors"}}]
    }));

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), vae);
}

#[test]
fn test_tied_priority_picks_smaller_relative_path() {
    let model = ModelDir::new();
    let first = model.touch("text_encoder/model.safetensors");
    model.touch("text_encoder_2/model.safetensors");

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), first);
}

#[test]
fn test_malformed_index_falls_back_to_names() {
    let model = ModelDir::new();
    let unet = model.touch("unet/diffusion_pytorch_model.bin");
    model.touch("lora/pytorch_lora_weights.safetensors");
    model.write("model_index.json", b"{ not json");

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), unet);
}

#[test]
fn test_backslash_index_paths_match() {
    let model = ModelDir::new();
    model.touch("unet/diffusion_pytorch_model.safetensors");
    let encoder = model.touch("text_encoder/model.safetensors");
    model.write_index(&json!({
        "weight_map": {
            "a": "text_encoder\\model.safetensors",
            "b": "text_encoder\\model.safetensors"
        }
    }));

    let resolver = WeightFileResolver::new(model.root());
    assert_eq!(resolver.resolve(None).unwrap(), encoder);
}

#[test]
fn test_resolution_is_deterministic() {
    let model = ModelDir::new();
    for rel in [
        "lora/b_lora.safetensors",
        "lora/a_lora.safetensors",
        "weights.ckpt",
        "extra/weights.pth",
    ] {
        model.touch(rel);
    }

    let resolver = WeightFileResolver::new(model.root());
    let first = resolver.resolve(None).unwrap();
    for _ in 0..5 {
        assert_eq!(resolver.resolve(None).unwrap(), first);
    }
    assert_eq!(first, model.root().join("lora/a_lora.safetensors"));
}
