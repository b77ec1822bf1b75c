use std::time::Instant;

use stream_diffusion_core::{
    ModelSource, StreamConfig, StreamDiffusion, StreamMode, TokenSource,
};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Model ID to load
    #[arg(long, default_value = "KBlueLeaf/kohaku-v2.1")]
    model_id: String,

    /// Prompt to use
    #[arg(short, long)]
    prompt: String,

    /// Input image to transform
    #[arg(short, long)]
    image: String,

    /// How many times to re-run the same frame (simulates a stream)
    #[arg(long, default_value_t = 10)]
    frames: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut stream = StreamDiffusion::new(
        StreamConfig {
            mode: StreamMode::Img2Img,
            enable_similar_image_filter: true,
            ..Default::default()
        },
        ModelSource::from_model_id(args.model_id),
        false,
        TokenSource::CacheToken,
        None,
    )?;

    stream.prepare(&args.prompt, 50)?;

    let input = image::open(&args.image)?;

    let start = Instant::now();

    let mut last = Vec::new();
    for _ in 0..args.frames {
        last = stream.generate(Some(&input))?;
    }

    let end = Instant::now();
    println!(
        "Took: {:.2}s ({:.2} fps)",
        end.duration_since(start).as_secs_f32(),
        args.frames as f32 / end.duration_since(start).as_secs_f32()
    );

    last[0].save("image.png")?;

    Ok(())
}
