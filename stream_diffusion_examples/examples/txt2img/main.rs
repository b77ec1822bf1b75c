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

    /// How many frames to generate back to back
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
            mode: StreamMode::Txt2Img,
            t_index_list: vec![0, 16, 32, 45],
            ..Default::default()
        },
        ModelSource::from_model_id(args.model_id),
        false,
        TokenSource::CacheToken,
        None,
    )?;

    stream.prepare(&args.prompt, 50)?;

    let start = Instant::now();

    let mut last = Vec::new();
    for _ in 0..args.frames {
        last = stream.generate(None)?;
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
