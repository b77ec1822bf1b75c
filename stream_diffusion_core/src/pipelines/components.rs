//! Stable Diffusion component construction from a diffusers-layout source.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    clip,
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use stream_diffusion_common::FileLoader;

use crate::models::{lora::LoraWeights, taesd::Taesd};

/// Tokenizer repo used when the model repo ships no `tokenizer.json`
/// (the classic SD 1.5 layout carries only vocab/merges files).
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Model family, which picks the CLIP text encoder configuration.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum SdVersion {
    #[default]
    #[serde(rename = "v1-5")]
    V1_5,
    #[serde(rename = "v2-1")]
    V2_1,
    /// SD-Turbo (the v2.1 architecture distilled for single-step use).
    #[serde(rename = "turbo")]
    Turbo,
}

serde_plain::derive_fromstr_from_deserialize!(SdVersion);

impl Display for SdVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1_5 => write!(f, "v1-5"),
            Self::V2_1 => write!(f, "v2-1"),
            Self::Turbo => write!(f, "turbo"),
        }
    }
}

impl SdVersion {
    pub fn clip_config(&self) -> clip::Config {
        match self {
            Self::V1_5 => clip::Config::v1_5(),
            Self::V2_1 | Self::Turbo => clip::Config::v2_1(),
        }
    }
}

/// Locate a component's safetensors file, preferring the full-precision name.
fn fetch_weights(loader: &FileLoader, component: &str) -> Result<PathBuf> {
    const CANDIDATES: [&str; 3] = [
        "diffusion_pytorch_model.safetensors",
        "diffusion_pytorch_model.fp16.safetensors",
        "model.safetensors",
    ];
    for name in CANDIDATES {
        if let Ok(path) = loader.get(&format!("{component}/{name}")) {
            return Ok(path);
        }
    }
    anyhow::bail!("no safetensors weights found for the `{component}` component")
}

pub(crate) fn load_tokenizer(loader: &FileLoader, version: SdVersion) -> Result<(Tokenizer, u32)> {
    let tokenizer_file = loader
        .get("tokenizer/tokenizer.json")
        .or_else(|_| loader.get_from(CLIP_TOKENIZER_REPO, "tokenizer.json"))?;
    let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(anyhow::Error::msg)?;

    let clip_config = version.clip_config();
    let vocab = tokenizer.get_vocab(true);
    let pad_token = clip_config
        .pad_with
        .clone()
        .unwrap_or_else(|| "<|endoftext|>".to_string());
    let pad_token_id = *vocab
        .get(pad_token.as_str())
        .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;
    Ok((tokenizer, pad_token_id))
}

pub(crate) fn build_text_encoder(
    loader: &FileLoader,
    version: SdVersion,
    dtype: DType,
    device: &Device,
) -> Result<clip::ClipTextTransformer> {
    let weights = fetch_weights(loader, "text_encoder")?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
    Ok(clip::ClipTextTransformer::new(vb, &version.clip_config())?)
}

pub(crate) fn build_unet(
    loader: &FileLoader,
    dtype: DType,
    device: &Device,
    use_flash_attn: bool,
    lora: Option<(&Path, f64)>,
) -> Result<UNet2DConditionModel> {
    let weights = fetch_weights(loader, "unet")?;
    let config = unet_config(loader)?;

    let vb = match lora {
        Some((lora_path, strength)) => {
            // Fuse the adapter into the raw weight map, then rebuild from it.
            let mut tensors = candle_core::safetensors::load(&weights, device)?;
            let adapter = LoraWeights::load(lora_path, device)?;
            let fused = adapter.fuse_into(&mut tensors, strength)?;
            if fused == 0 {
                anyhow::bail!("LoRA adapter matched no UNet parameters");
            }
            VarBuilder::from_tensors(tensors, dtype, device)
        }
        None => unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? },
    };
    Ok(UNet2DConditionModel::new(vb, 4, 4, use_flash_attn, config)?)
}

pub(crate) fn build_vae(
    loader: &FileLoader,
    dtype: DType,
    device: &Device,
) -> Result<AutoEncoderKL> {
    let weights = fetch_weights(loader, "vae")?;
    let config = vae_config(loader)?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
    Ok(AutoEncoderKL::new(vb, 3, 3, config)?)
}

pub(crate) fn build_taesd(
    loader: &FileLoader,
    repo: &str,
    dtype: DType,
    device: &Device,
) -> Result<Taesd> {
    let weights = loader.get_from(repo, "diffusion_pytorch_model.safetensors")?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
    info!("substituting the tiny autoencoder from `{repo}`.");
    Ok(Taesd::new(vb)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeadDim {
    Single(usize),
    PerBlock(Vec<usize>),
}

#[derive(Deserialize)]
struct UNetConfigJson {
    block_out_channels: Vec<usize>,
    #[serde(default)]
    cross_attention_dim: Option<usize>,
    #[serde(default)]
    attention_head_dim: Option<HeadDim>,
    #[serde(default)]
    layers_per_block: Option<usize>,
    #[serde(default)]
    use_linear_projection: Option<bool>,
}

fn unet_config(loader: &FileLoader) -> Result<UNet2DConditionModelConfig> {
    let config_file = loader.get("unet/config.json")?;
    let json: UNetConfigJson = serde_json::from_str(&std::fs::read_to_string(config_file)?)?;

    let n_blocks = json.block_out_channels.len();
    let head_dim = |i: usize| match &json.attention_head_dim {
        Some(HeadDim::Single(dim)) => *dim,
        Some(HeadDim::PerBlock(dims)) => dims.get(i).copied().unwrap_or(8),
        None => 8,
    };
    Ok(UNet2DConditionModelConfig {
        blocks: json
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| BlockConfig {
                out_channels,
                // The deepest block carries no cross attention.
                use_cross_attn: if i < n_blocks - 1 { Some(1) } else { None },
                attention_head_dim: head_dim(i),
            })
            .collect(),
        center_input_sample: false,
        cross_attention_dim: json.cross_attention_dim.unwrap_or(768),
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: json.layers_per_block.unwrap_or(2),
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: json.use_linear_projection.unwrap_or(false),
    })
}

#[derive(Deserialize)]
struct VaeConfigJson {
    #[serde(default)]
    block_out_channels: Option<Vec<usize>>,
    #[serde(default)]
    layers_per_block: Option<usize>,
    #[serde(default)]
    latent_channels: Option<usize>,
    #[serde(default)]
    norm_num_groups: Option<usize>,
}

fn vae_config(loader: &FileLoader) -> Result<AutoEncoderKLConfig> {
    let config_file = loader.get("vae/config.json")?;
    let json: VaeConfigJson = serde_json::from_str(&std::fs::read_to_string(config_file)?)?;
    Ok(AutoEncoderKLConfig {
        block_out_channels: json
            .block_out_channels
            .unwrap_or_else(|| vec![128, 256, 512, 512]),
        layers_per_block: json.layers_per_block.unwrap_or(2),
        latent_channels: json.latent_channels.unwrap_or(4),
        norm_num_groups: json.norm_num_groups.unwrap_or(32),
        use_quant_conv: true,
        use_post_quant_conv: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_from_str() {
        assert_eq!("v1-5".parse::<SdVersion>().unwrap(), SdVersion::V1_5);
        assert_eq!("turbo".parse::<SdVersion>().unwrap(), SdVersion::Turbo);
        assert!("sdxl".parse::<SdVersion>().is_err());
    }

    #[test]
    fn head_dim_accepts_scalar_and_list() {
        let scalar: UNetConfigJson =
            serde_json::from_str(r#"{"block_out_channels": [320, 640], "attention_head_dim": 8}"#)
                .unwrap();
        assert!(matches!(scalar.attention_head_dim, Some(HeadDim::Single(8))));

        let list: UNetConfigJson = serde_json::from_str(
            r#"{"block_out_channels": [320, 640], "attention_head_dim": [5, 10]}"#,
        )
        .unwrap();
        match list.attention_head_dim {
            Some(HeadDim::PerBlock(dims)) => assert_eq!(dims, vec![5, 10]),
            _ => panic!("expected per-block head dims"),
        }
    }
}
