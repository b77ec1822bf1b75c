mod components;
mod denoise;
mod filter;

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    clip::ClipTextTransformer,
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use stream_diffusion_common::{FileLoader, ModelSource, NiceProgressBar, TokenSource};

use crate::acceleration::Acceleration;
use crate::models::VaeKind;
use crate::util::TryIntoDType;
use crate::ModelDType;

pub use components::SdVersion;

/// Default LCM-LoRA adapter repo, fused unless the model is a turbo variant.
pub const LCM_LORA_DEFAULT: &str = "latent-consistency/lcm-lora-sdv1-5";
/// Default tiny autoencoder repo.
pub const TAESD_DEFAULT: &str = "madebyollin/taesd";

const DEFAULT_NUM_INFERENCE_STEPS: usize = 50;

/// Generation mode.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum StreamMode {
    #[default]
    #[serde(rename = "img2img")]
    Img2Img,
    #[serde(rename = "txt2img")]
    Txt2Img,
}

serde_plain::derive_fromstr_from_deserialize!(StreamMode);

impl Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Img2Img => write!(f, "img2img"),
            Self::Txt2Img => write!(f, "txt2img"),
        }
    }
}

/// Stream configuration.
///
/// `t_index_list` selects the denoising sub-schedule: each entry is an index
/// into the scheduler's timestep table for the prepared number of inference
/// steps. Fewer entries mean fewer UNet evaluations per frame.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub version: SdVersion,
    pub t_index_list: Vec<usize>,
    pub mode: StreamMode,
    pub width: usize,
    pub height: usize,
    pub dtype: ModelDType,
    /// Frames generated per txt2img call.
    pub frame_buffer_size: usize,
    /// Number of warmup UNet forwards after loading.
    pub warmup: usize,
    pub acceleration: Acceleration,
    pub use_lcm_lora: bool,
    pub lcm_lora_id: Option<String>,
    pub use_tiny_vae: bool,
    pub tiny_vae_id: Option<String>,
    /// Classifier-free guidance scale; guidance is applied when `> 1.0`.
    pub guidance_scale: f64,
    pub seed: u64,
    /// Root directory for compiled-engine caches.
    pub engine_dir: PathBuf,
    pub enable_similar_image_filter: bool,
    pub similar_image_filter_threshold: f32,
    pub similar_image_filter_max_skip_frames: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            version: SdVersion::V1_5,
            t_index_list: vec![22, 32, 45],
            mode: StreamMode::Img2Img,
            width: 512,
            height: 512,
            dtype: ModelDType::Auto,
            frame_buffer_size: 1,
            warmup: 10,
            acceleration: Acceleration::Tensorrt,
            use_lcm_lora: true,
            lcm_lora_id: None,
            use_tiny_vae: true,
            tiny_vae_id: None,
            guidance_scale: 1.2,
            seed: 2,
            engine_dir: PathBuf::from("engines"),
            enable_similar_image_filter: false,
            similar_image_filter_threshold: 0.95,
            similar_image_filter_max_skip_frames: 10,
        }
    }
}

impl StreamConfig {
    /// Denoising batch: one latent per schedule entry and buffered frame.
    pub fn batch_size(&self) -> usize {
        self.t_index_list.len() * self.frame_buffer_size
    }

    fn validate(&self) -> Result<()> {
        if self.t_index_list.is_empty() {
            anyhow::bail!("`t_index_list` must not be empty");
        }
        if !self.t_index_list.windows(2).all(|w| w[0] < w[1]) {
            anyhow::bail!("`t_index_list` must be strictly increasing");
        }
        if self.width % 8 != 0 || self.height % 8 != 0 {
            anyhow::bail!("width and height must be multiples of 8");
        }
        if self.frame_buffer_size == 0 {
            anyhow::bail!("`frame_buffer_size` must be at least 1");
        }
        Ok(())
    }
}

/// The UNet actually executing: the plain runtime module or a compiled
/// engine.
pub(crate) enum UNetModel {
    Candle(UNet2DConditionModel),
    #[cfg(feature = "tensorrt")]
    Onnx(crate::acceleration::OnnxUNet),
}

impl UNetModel {
    pub(crate) fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        match self {
            Self::Candle(unet) => Ok(unet.forward(latents, timestep, encoder_hidden_states)?),
            #[cfg(feature = "tensorrt")]
            Self::Onnx(unet) => unet.forward(latents, timestep, encoder_hidden_states),
        }
    }
}

/// A loaded streaming pipeline: model components, the prepared denoising
/// sub-schedule and cached prompt embeddings.
pub struct StreamDiffusion {
    config: StreamConfig,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_token_id: u32,
    text_encoder: ClipTextTransformer,
    unet: UNetModel,
    vae: VaeKind,
    scheduler: Option<Box<dyn Scheduler>>,
    sub_timesteps: Vec<usize>,
    prompt_embeds: Option<Tensor>,
    uncond_embeds: Option<Tensor>,
    filter: Option<filter::SimilarImageFilter>,
    prev_output: Option<Vec<DynamicImage>>,
}

impl StreamDiffusion {
    /// Load the model and make it ready for generation.
    ///
    /// This fetches and builds every component, optionally fuses the
    /// LCM-LoRA adapter, optionally substitutes the tiny autoencoder,
    /// attempts acceleration (falling back on failure), performs an initial
    /// empty-prompt prepare and runs the configured warmup.
    ///
    /// Note:
    /// - `token` and `revision` are only applicable for Hugging Face models.
    pub fn new(
        config: StreamConfig,
        source: ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        info!("loading from source: {source}.");

        #[cfg(not(feature = "metal"))]
        let device = Device::cuda_if_available(0)?;
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0)?;

        let dtype = config.dtype.try_into_dtype(&device, silent)?;
        let loader = FileLoader::from_model_source(&source, silent, token, revision)?;
        let model_id = source.id();

        let (tokenizer, pad_token_id) = components::load_tokenizer(&loader, config.version)?;
        let text_encoder = components::build_text_encoder(&loader, config.version, dtype, &device)?;

        let lora_path = resolve_lora_path(&config, &loader, &model_id)?;

        let use_flash_attn = match config.acceleration {
            Acceleration::FlashAttn if cfg!(feature = "flash-attn") => true,
            Acceleration::FlashAttn => {
                warn!("flash-attn acceleration requested but the `flash-attn` feature is not enabled. Falling back to normal mode.");
                false
            }
            _ => false,
        };

        let unet = components::build_unet(
            &loader,
            dtype,
            &device,
            use_flash_attn,
            lora_path.as_deref().map(|p| (p, 1.0)),
        )?;

        let vae = if config.use_tiny_vae {
            let repo = config.tiny_vae_id.clone().unwrap_or_else(|| TAESD_DEFAULT.to_string());
            VaeKind::Tiny(components::build_taesd(&loader, &repo, dtype, &device)?)
        } else {
            VaeKind::Kl(components::build_vae(&loader, dtype, &device)?)
        };

        let unet = match config.acceleration {
            Acceleration::Tensorrt => {
                #[cfg(feature = "tensorrt")]
                {
                    match Self::load_engine_unet(&config, &loader, &model_id) {
                        Ok(engine) => {
                            info!("TensorRT acceleration enabled.");
                            UNetModel::Onnx(engine)
                        }
                        Err(e) => {
                            warn!("acceleration has failed: {e:#}. Falling back to normal mode.");
                            UNetModel::Candle(unet)
                        }
                    }
                }
                #[cfg(not(feature = "tensorrt"))]
                {
                    warn!("tensorrt acceleration requested but the `tensorrt` feature is not enabled. Falling back to normal mode.");
                    UNetModel::Candle(unet)
                }
            }
            _ => UNetModel::Candle(unet),
        };

        let filter = config.enable_similar_image_filter.then(|| {
            filter::SimilarImageFilter::new(
                config.similar_image_filter_threshold,
                config.similar_image_filter_max_skip_frames,
            )
        });

        let mut this = Self {
            config,
            device,
            dtype,
            tokenizer,
            pad_token_id,
            text_encoder,
            unet,
            vae,
            scheduler: None,
            sub_timesteps: Vec::new(),
            prompt_embeds: None,
            uncond_embeds: None,
            filter,
            prev_output: None,
        };
        this.prepare("", DEFAULT_NUM_INFERENCE_STEPS)?;
        this.run_warmup()?;
        Ok(this)
    }

    #[cfg(feature = "tensorrt")]
    fn load_engine_unet(
        config: &StreamConfig,
        loader: &FileLoader,
        model_id: &str,
    ) -> Result<crate::acceleration::OnnxUNet> {
        let key = crate::acceleration::EngineKey {
            model_id,
            use_lcm_lora: config.use_lcm_lora,
            use_tiny_vae: config.use_tiny_vae,
            max_batch_size: config.batch_size(),
            min_batch_size: config.batch_size(),
            mode: config.mode,
        };
        let cache_dir = key.unet_engine_dir(&config.engine_dir);
        info!("engine cache directory: {}", cache_dir.display());
        let onnx_model = loader.get("unet/model.onnx")?;
        crate::acceleration::OnnxUNet::load(&onnx_model, &cache_dir)
    }

    /// Prepare the pipeline for a prompt.
    ///
    /// Seeds the RNG, builds the scheduler for `num_inference_steps`,
    /// resolves the denoising sub-schedule from `t_index_list` and caches
    /// the prompt embeddings.
    pub fn prepare(&mut self, prompt: &str, num_inference_steps: usize) -> Result<()> {
        self.device.set_seed(self.config.seed)?;

        let scheduler = DDIMSchedulerConfig::default().build(num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        for &index in &self.config.t_index_list {
            if index >= timesteps.len() {
                anyhow::bail!(
                    "t index {index} is out of range for {num_inference_steps} inference steps"
                );
            }
        }
        self.sub_timesteps = self
            .config
            .t_index_list
            .iter()
            .map(|&index| timesteps[index])
            .collect();

        self.prompt_embeds = Some(self.encode_prompt(prompt)?);
        self.uncond_embeds = if self.config.guidance_scale > 1.0 {
            Some(self.encode_prompt("")?)
        } else {
            None
        };
        self.scheduler = Some(scheduler);
        Ok(())
    }

    /// Generate images. In img2img mode an input image is required; in
    /// txt2img mode it is ignored.
    pub fn generate(&mut self, image: Option<&DynamicImage>) -> Result<Vec<DynamicImage>> {
        match self.config.mode {
            StreamMode::Img2Img => {
                let image = image.context("img2img mode requires an input image")?;
                self.img2img(image)
            }
            StreamMode::Txt2Img => self.txt2img(),
        }
    }

    /// Generate `frame_buffer_size` images from the prepared prompt.
    pub fn txt2img(&mut self) -> Result<Vec<DynamicImage>> {
        let scheduler = self.scheduler.as_ref().context("pipeline is not prepared")?;
        let batch = self.config.frame_buffer_size;
        let (latent_h, latent_w) = (self.config.height / 8, self.config.width / 8);

        let latents = (Tensor::randn(0f32, 1f32, (batch, 4, latent_h, latent_w), &self.device)?
            * scheduler.init_noise_sigma())?
        .to_dtype(self.dtype)?;

        let text_embeddings = self.embeddings_for(batch)?;
        let scheduler = self.scheduler.as_mut().context("pipeline is not prepared")?;
        let latents = denoise::denoise(
            &self.unet,
            scheduler.as_mut(),
            latents,
            &self.sub_timesteps,
            &text_embeddings,
            self.config.guidance_scale,
        )?;

        let decoded = self.vae.decode(&latents)?;
        postprocess_image(&decoded)
    }

    /// Transform an input image under the prepared prompt.
    pub fn img2img(&mut self, image: &DynamicImage) -> Result<Vec<DynamicImage>> {
        let input = preprocess_image(
            image,
            self.config.width,
            self.config.height,
            &self.device,
            self.dtype,
        )?;

        if let Some(filter) = &mut self.filter {
            if filter.should_skip(&input)? {
                if let Some(previous) = &self.prev_output {
                    info!("input frame is similar to the previous one, skipping inference.");
                    return Ok(previous.clone());
                }
            }
        }

        let scheduler = self.scheduler.as_ref().context("pipeline is not prepared")?;

        let init_latents = self.vae.encode(&input)?;
        let noise = Tensor::randn(0f32, 1f32, init_latents.dims(), &self.device)?
            .to_dtype(self.dtype)?;
        // The first sub-timestep sets how much of the input survives.
        let start = self.sub_timesteps[0];
        let latents = scheduler.add_noise(&init_latents, noise, start)?;

        let text_embeddings = self.embeddings_for(1)?;
        let scheduler = self.scheduler.as_mut().context("pipeline is not prepared")?;
        let latents = denoise::denoise(
            &self.unet,
            scheduler.as_mut(),
            latents,
            &self.sub_timesteps,
            &text_embeddings,
            self.config.guidance_scale,
        )?;

        let decoded = self.vae.decode(&latents)?;
        let images = postprocess_image(&decoded)?;
        self.prev_output = Some(images.clone());
        Ok(images)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn run_warmup(&mut self) -> Result<()> {
        if self.config.warmup == 0 {
            return Ok(());
        }
        let (latent_h, latent_w) = (self.config.height / 8, self.config.width / 8);
        let batch = if self.config.guidance_scale > 1.0 { 2 } else { 1 };
        let latents =
            Tensor::randn(0f32, 1f32, (batch, 4, latent_h, latent_w), &self.device)?
                .to_dtype(self.dtype)?;
        let text_embeddings = self.embeddings_for(1)?;
        let timestep = self.sub_timesteps[0] as f64;

        let start = Instant::now();
        for _ in NiceProgressBar::<_, 'b'>(0..self.config.warmup, "Warmup") {
            let _ = self.unet.forward(&latents, timestep, &text_embeddings)?;
        }
        info!(
            "warmup of {} iterations took {:.2}s.",
            self.config.warmup,
            start.elapsed().as_secs_f32()
        );
        Ok(())
    }

    /// Batched embeddings for a generation call, unconditional first when
    /// guidance is active.
    fn embeddings_for(&self, batch: usize) -> Result<Tensor> {
        let cond = self
            .prompt_embeds
            .as_ref()
            .context("pipeline is not prepared")?
            .repeat((batch, 1, 1))?;
        match &self.uncond_embeds {
            Some(uncond) => Ok(Tensor::cat(&[uncond.repeat((batch, 1, 1))?, cond], 0)?),
            None => Ok(cond),
        }
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.version.clip_config().max_position_embeddings;
        let mut ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        ids.truncate(max_len);
        while ids.len() < max_len {
            ids.push(self.pad_token_id);
        }
        let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&ids)?)
    }
}

/// Locate the LCM-LoRA weights when the adapter is enabled. Unlike the
/// acceleration path, a fetch failure here is an error: generating over a
/// short sub-schedule without the adapter would quietly degrade output.
fn resolve_lora_path(
    config: &StreamConfig,
    loader: &FileLoader,
    model_id: &str,
) -> Result<Option<PathBuf>> {
    // Turbo models are already few-step distilled; skip the adapter.
    if !config.use_lcm_lora || model_id.contains("turbo") {
        return Ok(None);
    }
    let repo = config
        .lcm_lora_id
        .clone()
        .unwrap_or_else(|| LCM_LORA_DEFAULT.to_string());
    info!("fusing LCM-LoRA from `{repo}`.");
    let path = loader
        .get_from(&repo, "pytorch_lora_weights.safetensors")
        .with_context(|| format!("could not fetch LCM-LoRA weights from `{repo}`"))?;
    Ok(Some(path))
}

/// Resize and normalize an image to a `[-1, 1]` NCHW tensor.
pub(crate) fn preprocess_image(
    image: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let image = image
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8();
    let data = image.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = ((tensor / 127.5)? - 1.0)?;
    Ok(tensor.unsqueeze(0)?.to_device(device)?.to_dtype(dtype)?)
}

/// Convert a decoded `[-1, 1]` NCHW batch into images.
pub(crate) fn postprocess_image(decoded: &Tensor) -> Result<Vec<DynamicImage>> {
    let decoded = decoded.to_dtype(DType::F32)?;
    let (batch, channels, height, width) = decoded.dims4()?;
    if channels != 3 {
        anyhow::bail!("expected 3 channels in the decoded image output");
    }
    let scaled = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;

    let mut images = Vec::with_capacity(batch);
    for chunk in scaled.chunk(batch, 0)? {
        let flattened = chunk.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
        #[allow(clippy::cast_possible_truncation)]
        let image = RgbImage::from_raw(width as u32, height as u32, flattened.to_vec1::<u8>()?)
            .context("decoded image has invalid capacity")?;
        images.push(DynamicImage::ImageRgb8(image));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_bookkeeping() {
        let config = StreamConfig {
            t_index_list: vec![0, 16, 32, 45],
            frame_buffer_size: 2,
            ..Default::default()
        };
        assert_eq!(config.batch_size(), 8);
    }

    #[test]
    fn validation_rejects_bad_schedules() {
        let empty = StreamConfig {
            t_index_list: vec![],
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let unsorted = StreamConfig {
            t_index_list: vec![32, 22, 45],
            ..Default::default()
        };
        assert!(unsorted.validate().is_err());

        let ok = StreamConfig::default();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unaligned_resolution() {
        let config = StreamConfig {
            width: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn image_conversion_round_trip() -> Result<()> {
        let mut source = image::RgbImage::new(16, 8);
        for (x, _y, pixel) in source.enumerate_pixels_mut() {
            *pixel = image::Rgb([(x * 16) as u8, 128, 255]);
        }
        let input = DynamicImage::ImageRgb8(source.clone());

        let tensor = preprocess_image(&input, 16, 8, &Device::Cpu, DType::F32)?;
        assert_eq!(tensor.dims4()?, (1, 3, 8, 16));

        let images = postprocess_image(&tensor)?;
        assert_eq!(images.len(), 1);
        let output = images[0].to_rgb8();
        assert_eq!(output.dimensions(), (16, 8));
        // Normalization and denormalization land within rounding error.
        for (a, b) in source.pixels().zip(output.pixels()) {
            for c in 0..3 {
                assert!((a.0[c] as i16 - b.0[c] as i16).abs() <= 1);
            }
        }
        Ok(())
    }

    #[test]
    fn postprocess_splits_batches() -> Result<()> {
        let batch = Tensor::zeros((3, 3, 8, 8), DType::F32, &Device::Cpu)?;
        let images = postprocess_image(&batch)?;
        assert_eq!(images.len(), 3);
        Ok(())
    }

    #[test]
    fn postprocess_rejects_non_rgb() {
        let batch = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(postprocess_image(&batch).is_err());
    }

    #[test]
    fn missing_lora_weights_fail_loading() {
        let loader = FileLoader::LocalDir(std::env::temp_dir());
        let config = StreamConfig {
            lcm_lora_id: Some(std::env::temp_dir().display().to_string()),
            ..Default::default()
        };
        assert!(resolve_lora_path(&config, &loader, "some/model").is_err());
    }

    #[test]
    fn turbo_models_skip_the_lora() {
        let loader = FileLoader::LocalDir(std::env::temp_dir());
        let config = StreamConfig::default();
        let path = resolve_lora_path(&config, &loader, "stabilityai/sd-turbo").unwrap();
        assert!(path.is_none());
    }

    #[test]
    fn disabled_lora_resolves_to_none() {
        let loader = FileLoader::LocalDir(std::env::temp_dir());
        let config = StreamConfig {
            use_lcm_lora: false,
            ..Default::default()
        };
        let path = resolve_lora_path(&config, &loader, "some/model").unwrap();
        assert!(path.is_none());
    }

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("img2img".parse::<StreamMode>().unwrap(), StreamMode::Img2Img);
        assert_eq!(StreamMode::Txt2Img.to_string(), "txt2img");
    }
}
