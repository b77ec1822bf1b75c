//! LoRA adapter loading and weight fusion.
//!
//! Adapters are fused offline into the UNet weight map before the module is
//! built: `W' = W + strength * (alpha / rank) * (up @ down)`. Both the kohya
//! (`lora_unet_*`, `.lora_down`/`.lora_up`) and peft (`unet.*`,
//! `.lora_A`/`.lora_B`) key conventions are understood.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::info;

/// One low-rank factor pair targeting a UNet parameter.
pub struct LoraLayer {
    down: Tensor,
    up: Tensor,
    alpha: f32,
}

impl LoraLayer {
    /// `strength * (alpha / rank) * (up @ down)`, reshaped to `shape`.
    ///
    /// Conv factors come in as 4-D tensors; the matmul runs on the flattened
    /// 2-D views and the result is reshaped back to the parameter shape.
    pub fn delta(&self, strength: f64, shape: &candle_core::Shape) -> Result<Tensor> {
        let rank = self.down.dim(0)?;
        let down = if self.down.rank() > 2 {
            self.down.flatten_from(1)?
        } else {
            self.down.clone()
        };
        let up = if self.up.rank() > 2 {
            self.up.flatten_from(1)?
        } else {
            self.up.clone()
        };
        let scale = strength * (self.alpha as f64 / rank as f64);
        let delta = (up.matmul(&down)? * scale)?;
        Ok(delta.reshape(shape.clone())?)
    }
}

/// A parsed LoRA adapter, keyed by the UNet parameter it targets (without
/// the trailing `.weight`).
pub struct LoraWeights {
    layers: HashMap<String, LoraLayer>,
}

impl LoraWeights {
    /// Load and parse a LoRA safetensors file. Factors are converted to F32
    /// for the fusion math.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("could not load LoRA from `{}`", path.display()))?;

        let mut downs: HashMap<String, Tensor> = HashMap::new();
        let mut ups: HashMap<String, Tensor> = HashMap::new();
        let mut alphas: HashMap<String, f32> = HashMap::new();

        for (name, tensor) in tensors {
            let Some((target, part)) = classify_key(&name) else {
                continue;
            };
            match part {
                LoraPart::Down => {
                    downs.insert(target, tensor.to_dtype(DType::F32)?);
                }
                LoraPart::Up => {
                    ups.insert(target, tensor.to_dtype(DType::F32)?);
                }
                LoraPart::Alpha => {
                    let alpha = tensor.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                    alphas.insert(target, alpha);
                }
            }
        }

        let mut layers = HashMap::new();
        for (target, down) in downs {
            let Some(up) = ups.remove(&target) else {
                continue;
            };
            let rank = down.dim(0)? as f32;
            let alpha = alphas.get(&target).copied().unwrap_or(rank);
            layers.insert(target, LoraLayer { down, up, alpha });
        }

        if layers.is_empty() {
            anyhow::bail!(
                "no LoRA layer pairs found in `{}`; unsupported key convention?",
                path.display()
            );
        }
        Ok(Self { layers })
    }

    /// Fuse every matching layer into `base`, returning how many parameters
    /// were touched. Layers without a matching base parameter are skipped.
    pub fn fuse_into(&self, base: &mut HashMap<String, Tensor>, strength: f64) -> Result<usize> {
        let mut fused = 0usize;
        for (target, layer) in &self.layers {
            let key = format!("{target}.weight");
            let Some(weight) = base.get(&key) else {
                continue;
            };
            let delta = layer
                .delta(strength, weight.shape())?
                .to_dtype(weight.dtype())?;
            let merged = (weight + delta)?;
            base.insert(key, merged);
            fused += 1;
        }
        info!(
            "fused {fused}/{} LoRA layers at strength {strength}.",
            self.layers.len()
        );
        Ok(fused)
    }
}

enum LoraPart {
    Down,
    Up,
    Alpha,
}

/// Map a raw LoRA tensor name onto the targeted UNet parameter name.
fn classify_key(name: &str) -> Option<(String, LoraPart)> {
    let (stem, part) = if let Some(stem) = name
        .strip_suffix(".lora_down.weight")
        .or_else(|| name.strip_suffix(".lora_A.weight"))
    {
        (stem, LoraPart::Down)
    } else if let Some(stem) = name
        .strip_suffix(".lora_up.weight")
        .or_else(|| name.strip_suffix(".lora_B.weight"))
    {
        (stem, LoraPart::Up)
    } else if let Some(stem) = name.strip_suffix(".alpha") {
        (stem, LoraPart::Alpha)
    } else {
        return None;
    };

    // peft names are already dotted: `unet.down_blocks.0...`
    if let Some(rest) = stem.strip_prefix("unet.") {
        return Some((rest.to_string(), part));
    }
    // kohya names use underscores throughout: `lora_unet_down_blocks_0...`
    if let Some(rest) = stem.strip_prefix("lora_unet_") {
        return Some((undot_kohya(rest), part));
    }
    None
}

/// Convert a kohya underscore-separated module path to the dotted diffusers
/// name, restoring the compound identifiers the underscore split mangles.
fn undot_kohya(name: &str) -> String {
    const COMPOUNDS: &[(&str, &str)] = &[
        ("down.blocks", "down_blocks"),
        ("up.blocks", "up_blocks"),
        ("mid.block", "mid_block"),
        ("transformer.blocks", "transformer_blocks"),
        ("proj.in", "proj_in"),
        ("proj.out", "proj_out"),
        ("to.q", "to_q"),
        ("to.k", "to_k"),
        ("to.v", "to_v"),
        ("to.out", "to_out"),
        ("conv.shortcut", "conv_shortcut"),
        ("conv.in", "conv_in"),
        ("conv.out", "conv_out"),
        ("time.embedding", "time_embedding"),
        ("time.emb.proj", "time_emb_proj"),
        ("linear.1", "linear_1"),
        ("linear.2", "linear_2"),
    ];
    let mut dotted = name.replace('_', ".");
    for (broken, fixed) in COMPOUNDS {
        dotted = dotted.replace(broken, fixed);
    }
    dotted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_kohya_keys() {
        let (target, _) = classify_key(
            "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q.lora_down.weight",
        )
        .unwrap();
        assert_eq!(
            target,
            "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q"
        );
    }

    #[test]
    fn maps_kohya_ff_and_out_projection() {
        let (target, _) = classify_key(
            "lora_unet_mid_block_attentions_0_transformer_blocks_0_ff_net_0_proj.lora_up.weight",
        )
        .unwrap();
        assert_eq!(
            target,
            "mid_block.attentions.0.transformer_blocks.0.ff.net.0.proj"
        );

        let (target, _) =
            classify_key("lora_unet_up_blocks_1_attentions_2_transformer_blocks_0_attn2_to_out_0.alpha")
                .unwrap();
        assert_eq!(
            target,
            "up_blocks.1.attentions.2.transformer_blocks.0.attn2.to_out.0"
        );
    }

    #[test]
    fn maps_peft_keys() {
        let (target, _) = classify_key(
            "unet.down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k.lora_A.weight",
        )
        .unwrap();
        assert_eq!(
            target,
            "down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k"
        );
    }

    #[test]
    fn ignores_non_unet_keys() {
        assert!(classify_key("lora_te_text_model_encoder_layers_0_mlp_fc1.lora_down.weight").is_none());
        assert!(classify_key("unet.down_blocks.0.attn1.to_q.weight").is_none());
    }

    #[test]
    fn delta_matches_scaled_factor_product() -> Result<()> {
        let device = Device::Cpu;
        // rank 2, 3x4 target
        let down = Tensor::from_vec(
            vec![1f32, 0., 0., 0., 0., 1., 0., 0.],
            (2, 4),
            &device,
        )?;
        let up = Tensor::from_vec(vec![1f32, 0., 0., 1., 1., 1.], (3, 2), &device)?;
        let layer = LoraLayer {
            down,
            up,
            alpha: 4.0,
        };
        // alpha/rank = 2, strength 0.5 => scale 1.0
        let delta = layer.delta(0.5, &(3usize, 4usize).into())?;
        let expect = [
            [1f32, 0., 0., 0.],
            [0., 1., 0., 0.],
            [1., 1., 0., 0.],
        ];
        assert_eq!(delta.to_vec2::<f32>()?, expect);
        Ok(())
    }

    #[test]
    fn fuse_touches_only_matching_parameters() -> Result<()> {
        let device = Device::Cpu;
        let mut base = HashMap::new();
        base.insert(
            "down_blocks.0.attn1.to_q.weight".to_string(),
            Tensor::zeros((3, 4), DType::F32, &device)?,
        );
        base.insert(
            "down_blocks.0.attn1.to_k.weight".to_string(),
            Tensor::zeros((3, 4), DType::F32, &device)?,
        );

        let mut layers = HashMap::new();
        layers.insert(
            "down_blocks.0.attn1.to_q".to_string(),
            LoraLayer {
                down: Tensor::ones((2, 4), DType::F32, &device)?,
                up: Tensor::ones((3, 2), DType::F32, &device)?,
                alpha: 2.0,
            },
        );
        layers.insert(
            "somewhere.else".to_string(),
            LoraLayer {
                down: Tensor::ones((2, 4), DType::F32, &device)?,
                up: Tensor::ones((3, 2), DType::F32, &device)?,
                alpha: 2.0,
            },
        );
        let lora = LoraWeights { layers };

        let fused = lora.fuse_into(&mut base, 1.0)?;
        assert_eq!(fused, 1);
        // up@down of ones is 2.0 everywhere, alpha/rank = 1.
        let q = base["down_blocks.0.attn1.to_q.weight"].to_vec2::<f32>()?;
        assert_eq!(q[0][0], 2.0);
        let k = base["down_blocks.0.attn1.to_k.weight"].to_vec2::<f32>()?;
        assert_eq!(k[0][0], 0.0);
        Ok(())
    }
}
