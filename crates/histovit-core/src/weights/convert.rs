//! Compatibility conversion for DINOv2-native checkpoints.
//!
//! The ViT-L/14 release stores its state dict in DINOv2's own layout:
//! a `mask_token` the embedder never uses, `register_tokens` under the
//! upstream name, and a positional embedding whose first slot belongs to
//! the class token. The target layout keeps register tokens as
//! `reg_token`, positions only the patch grid, and folds the class slot
//! into the class token itself. Fused-MLP checkpoints additionally name
//! their projections `w12`/`w3` instead of `fc1`/`fc2`.

use tracing::debug;

use crate::error::{Error, Result};
use crate::weights::checkpoint::StateDict;

/// Convert a DINOv2-layout state dict to the target parameter layout.
///
/// Must run for the one variant whose release is DINOv2-native, and only
/// that one; applied anywhere else the fold corrupts the class token.
pub fn convert_dinov2(sd: StateDict) -> Result<StateDict> {
    let mut tensors = sd.into_tensors();

    // Pretraining artifact with no inference-time counterpart.
    if tensors.remove("mask_token").is_some() {
        debug!("Dropped mask_token from DINOv2 checkpoint");
    }

    if let Some(reg) = tensors.remove("register_tokens") {
        let pos = tensors.remove("pos_embed").ok_or_else(|| {
            Error::CheckpointMismatch("DINOv2 checkpoint has no pos_embed".to_string())
        })?;
        let cls = tensors.remove("cls_token").ok_or_else(|| {
            Error::CheckpointMismatch("DINOv2 checkpoint has no cls_token".to_string())
        })?;

        let slots = pos.dim(1)?;
        if slots < 2 {
            return Err(Error::CheckpointMismatch(format!(
                "pos_embed has {slots} slot(s), expected a class slot plus a patch grid"
            )));
        }

        // The class token absorbs its positional slot; the remaining grid
        // positions only the patches.
        let cls = (cls + pos.narrow(1, 0, 1)?)?;
        let pos = pos.narrow(1, 1, slots - 1)?.contiguous()?;

        tensors.insert("cls_token".to_string(), cls);
        tensors.insert("reg_token".to_string(), reg);
        tensors.insert("pos_embed".to_string(), pos);
        debug!("Re-seated register tokens and positional embedding");
    }

    let renames: Vec<(String, String)> = tensors
        .keys()
        .filter_map(|key| {
            if key.contains(".mlp.w12.") {
                Some((key.clone(), key.replace(".mlp.w12.", ".mlp.fc1.")))
            } else if key.contains(".mlp.w3.") {
                Some((key.clone(), key.replace(".mlp.w3.", ".mlp.fc2.")))
            } else {
                None
            }
        })
        .collect();
    for (old, new) in renames {
        if let Some(tensor) = tensors.remove(&old) {
            tensors.insert(new, tensor);
        }
    }

    Ok(StateDict::from_tensors(tensors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vit::VitConfig;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    fn tiny_dinov2() -> VitConfig {
        VitConfig {
            img_size: 16,
            patch_size: 4,
            in_chans: 3,
            embed_dim: 8,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 2,
            reg_tokens: 2,
            init_values: Some(1e-5),
            embed_class_token: false,
            dynamic_img_size: true,
            layer_norm_eps: 1e-6,
        }
    }

    /// A checkpoint in upstream DINOv2 naming for the tiny config.
    fn upstream_dict(config: &VitConfig) -> StateDict {
        let dev = &Device::Cpu;
        let mut tensors = HashMap::new();
        for (name, shape) in config.parameter_spec() {
            match name.as_str() {
                "cls_token" => {
                    tensors.insert(name, Tensor::ones(shape, DType::F32, dev).unwrap());
                }
                "reg_token" => {
                    tensors.insert(
                        "register_tokens".to_string(),
                        Tensor::zeros(shape, DType::F32, dev).unwrap(),
                    );
                }
                "pos_embed" => {
                    // Upstream grid carries the class slot up front.
                    let padded = vec![shape[0], shape[1] + 1, shape[2]];
                    let t = Tensor::ones(padded, DType::F32, dev).unwrap();
                    tensors.insert(name, (t * 2.0).unwrap());
                }
                _ => {
                    tensors.insert(name, Tensor::zeros(shape, DType::F32, dev).unwrap());
                }
            }
        }
        tensors.insert(
            "mask_token".to_string(),
            Tensor::zeros((1, config.embed_dim), DType::F32, dev).unwrap(),
        );
        StateDict::from_tensors(tensors)
    }

    #[test]
    fn direct_load_of_upstream_layout_fails() {
        let config = tiny_dinov2();
        let sd = upstream_dict(&config);
        let err = sd.verify_strict(&config.parameter_spec()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("reg_token"));
        assert!(msg.contains("mask_token"));
        assert!(msg.contains("pos_embed"));
    }

    #[test]
    fn converted_load_succeeds() {
        let config = tiny_dinov2();
        let sd = convert_dinov2(upstream_dict(&config)).unwrap();
        sd.verify_strict(&config.parameter_spec()).unwrap();
        assert!(!sd.contains("mask_token"));
        assert!(!sd.contains("register_tokens"));
    }

    #[test]
    fn class_token_absorbs_its_positional_slot() {
        let config = tiny_dinov2();
        let sd = convert_dinov2(upstream_dict(&config)).unwrap();
        // Upstream: cls_token = 1, pos slots = 2 everywhere.
        let cls = sd.get("cls_token").unwrap();
        let values = cls.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for v in values {
            assert!((v - 3.0).abs() < 1e-6);
        }
        let pos = sd.get("pos_embed").unwrap();
        assert_eq!(pos.dims()[1], config.num_patches());
    }

    #[test]
    fn fused_mlp_keys_are_renamed() {
        let dev = &Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "blocks.0.mlp.w12.weight".to_string(),
            Tensor::zeros((4, 2), DType::F32, dev).unwrap(),
        );
        tensors.insert(
            "blocks.0.mlp.w3.bias".to_string(),
            Tensor::zeros(2, DType::F32, dev).unwrap(),
        );
        let sd = convert_dinov2(StateDict::from_tensors(tensors)).unwrap();
        assert!(sd.contains("blocks.0.mlp.fc1.weight"));
        assert!(sd.contains("blocks.0.mlp.fc2.bias"));
        assert!(!sd.contains("blocks.0.mlp.w12.weight"));
        assert!(!sd.contains("blocks.0.mlp.w3.bias"));
    }
}
