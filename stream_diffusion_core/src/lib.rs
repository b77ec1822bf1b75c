//! Core crate for interacting with stream_diffusion.
//!
//! The API wraps a Stable Diffusion pipeline for real-time streaming use:
//! load once, prepare a prompt, then call `generate` per frame.
//!
//! ```rust,no_run
//! use std::time::Instant;
//!
//! use stream_diffusion_core::{ModelSource, StreamConfig, StreamDiffusion, StreamMode, TokenSource};
//!
//! let mut stream = StreamDiffusion::new(
//!     StreamConfig {
//!         mode: StreamMode::Txt2Img,
//!         t_index_list: vec![0, 16, 32, 45],
//!         ..Default::default()
//!     },
//!     ModelSource::from_model_id("KBlueLeaf/kohaku-v2.1"),
//!     true,
//!     TokenSource::CacheToken,
//!     None,
//! )?;
//!
//! stream.prepare("1girl with brown dog hair, thick glasses, smiling", 50)?;
//!
//! let start = Instant::now();
//! let images = stream.generate(None)?;
//! let end = Instant::now();
//! println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());
//!
//! images[0].save("image.png")?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod acceleration;
mod models;
mod pipelines;
mod util;

pub use acceleration::Acceleration;
pub use pipelines::{
    SdVersion, StreamConfig, StreamDiffusion, StreamMode, LCM_LORA_DEFAULT, TAESD_DEFAULT,
};
pub use stream_diffusion_common::{ModelSource, TokenSource};
pub use util::{ModelDType, TryIntoDType};
