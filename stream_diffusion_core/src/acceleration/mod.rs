//! Accelerated UNet execution.
//!
//! The `tensorrt` mode hands the UNet to ONNX Runtime with the TensorRT
//! execution provider, which compiles the network into an engine cached on
//! disk under a per-configuration directory. Any failure on this path is
//! logged and execution falls back to the plain runtime.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::pipelines::StreamMode;

#[cfg(feature = "tensorrt")]
use anyhow::Result;
#[cfg(feature = "tensorrt")]
use candle_core::{DType, Tensor};

/// Acceleration mode for the UNet.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum Acceleration {
    /// Plain runtime execution.
    #[serde(rename = "none")]
    None,
    /// Flash attention kernels (requires the `flash-attn` feature).
    #[serde(rename = "flash-attn")]
    FlashAttn,
    /// ONNX Runtime with the TensorRT execution provider and on-disk engine
    /// caching (requires the `tensorrt` feature).
    #[default]
    #[serde(rename = "tensorrt")]
    Tensorrt,
}

serde_plain::derive_fromstr_from_deserialize!(Acceleration);

impl Display for Acceleration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::FlashAttn => write!(f, "flash-attn"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

/// Everything that uniquely identifies a compiled engine.
#[derive(Clone, Debug)]
pub struct EngineKey<'a> {
    pub model_id: &'a str,
    pub use_lcm_lora: bool,
    pub use_tiny_vae: bool,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub mode: StreamMode,
}

impl EngineKey<'_> {
    /// Cache-directory prefix for this configuration. Engines are only valid
    /// for the exact model/adapter/batch/mode combination they were compiled
    /// for, so all of it goes into the key.
    pub fn prefix(&self) -> String {
        let model_id: String = self
            .model_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
            .collect();
        format!(
            "{model_id}--lcm_lora-{}--tiny_vae-{}--max_batch-{}--min_batch-{}--mode-{}",
            self.use_lcm_lora,
            self.use_tiny_vae,
            self.max_batch_size,
            self.min_batch_size,
            self.mode,
        )
    }

    /// Directory holding the compiled UNet engine artifacts.
    pub fn unet_engine_dir(&self, engine_dir: &Path) -> PathBuf {
        engine_dir.join(self.prefix()).join("unet")
    }
}

/// UNet running inside ONNX Runtime.
///
/// The session is configured with the TensorRT execution provider first
/// (engine cache enabled) and the CUDA provider as a second choice. Latents
/// are shuttled through host memory in F32 on both directions.
#[cfg(feature = "tensorrt")]
pub struct OnnxUNet {
    session: ort::session::Session,
}

#[cfg(feature = "tensorrt")]
impl OnnxUNet {
    pub fn load(onnx_model: &Path, engine_cache_dir: &Path) -> Result<Self> {
        use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
        use ort::session::{builder::GraphOptimizationLevel, Session};

        std::fs::create_dir_all(engine_cache_dir)?;
        let session = Session::builder()?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(engine_cache_dir.to_string_lossy())
                    .build()
                    .error_on_failure(),
                CUDAExecutionProvider::default().build(),
            ])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(onnx_model)?;
        Ok(Self { session })
    }

    pub fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let (b, c, h, w) = latents.dims4()?;
        let (eb, seq, dim) = encoder_hidden_states.dims3()?;

        let sample = latents
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let context = encoder_hidden_states
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let outputs = self.session.run(ort::inputs![
            "sample" => ort::value::Tensor::from_array(([b, c, h, w], sample))?,
            "timestep" => ort::value::Tensor::from_array(([1usize], vec![timestep as i64]))?,
            "encoder_hidden_states" => ort::value::Tensor::from_array(([eb, seq, dim], context))?,
        ]?)?;

        let (shape, data) = outputs["out_sample"].try_extract_raw_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        let out = Tensor::from_vec(data.to_vec(), dims, &candle_core::Device::Cpu)?
            .to_device(latents.device())?
            .to_dtype(latents.dtype())?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(mode: StreamMode) -> EngineKey<'static> {
        EngineKey {
            model_id: "stable-diffusion-v1-5/stable-diffusion-v1-5",
            use_lcm_lora: true,
            use_tiny_vae: false,
            max_batch_size: 3,
            min_batch_size: 3,
            mode,
        }
    }

    #[test]
    fn prefix_carries_every_cache_dimension() {
        let prefix = key(StreamMode::Img2Img).prefix();
        assert_eq!(
            prefix,
            "stable-diffusion-v1-5-stable-diffusion-v1-5--lcm_lora-true--tiny_vae-false--max_batch-3--min_batch-3--mode-img2img"
        );
    }

    #[test]
    fn prefix_distinguishes_modes() {
        assert_ne!(
            key(StreamMode::Img2Img).prefix(),
            key(StreamMode::Txt2Img).prefix()
        );
    }

    #[test]
    fn unet_engine_dir_nests_under_prefix() {
        let dir = key(StreamMode::Txt2Img).unet_engine_dir(Path::new("engines"));
        assert!(dir.starts_with("engines"));
        assert!(dir.ends_with("unet"));
        assert_eq!(dir.components().count(), 3);
    }

    #[test]
    fn acceleration_parses_and_displays() {
        assert_eq!(
            "tensorrt".parse::<Acceleration>().unwrap(),
            Acceleration::Tensorrt
        );
        assert_eq!(Acceleration::FlashAttn.to_string(), "flash-attn");
        assert!("sfast".parse::<Acceleration>().is_err());
    }
}
