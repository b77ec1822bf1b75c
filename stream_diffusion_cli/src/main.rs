use cliclack::input;
use std::{path::PathBuf, time::Instant};

use clap::{Parser, Subcommand};
use stream_diffusion_core::{
    Acceleration, ModelDType, ModelSource, SdVersion, StreamConfig, StreamDiffusion, StreamMode,
    TokenSource,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Subcommand)]
pub enum SourceCommand {
    /// Load the model from some Hugging Face model ID
    ModelId {
        /// Model ID
        #[arg(short, long)]
        model_id: String,
    },

    /// Load the model from a local diffusers-layout directory
    Local {
        /// Directory path
        #[arg(short, long)]
        path: String,
    },
}

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    source: SourceCommand,

    /// Hugging Face token. Useful for accessing gated repositories.
    /// By default, the Hugging Face token at ~/.cache/huggingface/token is used.
    #[arg(long)]
    token: Option<String>,

    /// Model family, which selects the text encoder configuration.
    #[arg(long, value_enum, default_value_t = SdVersion::V1_5)]
    version: SdVersion,

    /// Generation mode.
    #[arg(long, value_enum, default_value_t = StreamMode::Img2Img)]
    mode: StreamMode,

    /// Denoising sub-schedule: indices into the scheduler timesteps.
    #[arg(long, value_delimiter = ',', default_values_t = [22usize, 32, 45])]
    t_index_list: Vec<usize>,

    /// Number of inference steps the schedule is built over.
    #[arg(short, long, default_value_t = 50)]
    num_steps: usize,

    /// Guidance scale. Values above 1.0 enable classifier-free guidance.
    #[arg(short, long, default_value_t = 1.2)]
    scale: f64,

    #[arg(long, default_value_t = 512)]
    width: usize,

    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Model datatype.
    #[arg(long, value_enum, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// UNet acceleration mode. Failures fall back to plain execution.
    #[arg(long, value_enum, default_value_t = Acceleration::Tensorrt)]
    acceleration: Acceleration,

    /// Skip fusing the LCM-LoRA adapter.
    #[arg(long)]
    no_lcm_lora: bool,

    /// LCM-LoRA repo to fuse instead of the default.
    #[arg(long)]
    lcm_lora_id: Option<String>,

    /// Use the full KL autoencoder instead of the tiny one.
    #[arg(long)]
    no_tiny_vae: bool,

    /// Tiny autoencoder repo to use instead of the default.
    #[arg(long)]
    tiny_vae_id: Option<String>,

    /// Frames generated per txt2img call.
    #[arg(long, default_value_t = 1)]
    frame_buffer_size: usize,

    /// Number of warmup UNet forwards after loading.
    #[arg(long, default_value_t = 10)]
    warmup: usize,

    #[arg(long, default_value_t = 2)]
    seed: u64,

    /// Directory for compiled-engine caches.
    #[arg(long, default_value = "engines")]
    engine_dir: PathBuf,

    /// Skip inference on input frames nearly identical to the previous one.
    #[arg(long)]
    similar_image_filter: bool,

    #[arg(long, default_value_t = 0.95)]
    similar_image_filter_threshold: f32,

    #[arg(long, default_value_t = 10)]
    similar_image_filter_max_skip_frames: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source = match args.source {
        SourceCommand::ModelId { model_id } => ModelSource::from_model_id(model_id),
        SourceCommand::Local { path } => ModelSource::local_dir(path)?,
    };
    let token = args
        .token
        .map(TokenSource::Literal)
        .unwrap_or(TokenSource::CacheToken);

    let config = StreamConfig {
        version: args.version,
        t_index_list: args.t_index_list,
        mode: args.mode,
        width: args.width,
        height: args.height,
        dtype: args.dtype,
        frame_buffer_size: args.frame_buffer_size,
        warmup: args.warmup,
        acceleration: args.acceleration,
        use_lcm_lora: !args.no_lcm_lora,
        lcm_lora_id: args.lcm_lora_id,
        use_tiny_vae: !args.no_tiny_vae,
        tiny_vae_id: args.tiny_vae_id,
        guidance_scale: args.scale,
        seed: args.seed,
        engine_dir: args.engine_dir,
        enable_similar_image_filter: args.similar_image_filter,
        similar_image_filter_threshold: args.similar_image_filter_threshold,
        similar_image_filter_max_skip_frames: args.similar_image_filter_max_skip_frames,
    };
    let mode = config.mode;

    let mut stream = StreamDiffusion::new(config, source, false, token, None)?;

    loop {
        let prompt: String = input("Prompt:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Prompt is required!")
                } else {
                    Ok(())
                }
            })
            .interact()?;

        stream.prepare(&prompt, args.num_steps)?;

        let image = if mode == StreamMode::Img2Img {
            let in_file: String = input("Input image:")
                .validate(|input: &String| {
                    if input.is_empty() {
                        Err("Input image path is required!".to_string())
                    } else if !PathBuf::from(input).is_file() {
                        Err("File does not exist!".to_string())
                    } else {
                        Ok(())
                    }
                })
                .interact()?;
            Some(image::open(in_file)?)
        } else {
            None
        };

        let start = Instant::now();

        let images = stream.generate(image.as_ref())?;

        let end = Instant::now();
        println!(
            "Image generation took: {:.2}s",
            end.duration_since(start).as_secs_f32()
        );

        let out_file: String = input("Save image to:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Image path is required!")
                } else {
                    let path = PathBuf::from(input);
                    let ext = path.extension().ok_or("Extension is required!")?;
                    if !["png", "jpg"].contains(&ext.to_str().unwrap()) {
                        Err(".png or .jpg extension is required!")
                    } else {
                        Ok(())
                    }
                }
            })
            .interact()?;

        images[0].save(out_file)?;
    }
}
