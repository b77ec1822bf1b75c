pub mod lora;
pub mod taesd;

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;

use taesd::Taesd;

/// Scale applied to KL VAE latents (the SD latent-space convention).
pub const KL_SCALE_FACTOR: f64 = 0.18215;

/// The decoder/encoder actually in use. The tiny autoencoder is a drop-in
/// substitute with a scaling factor of 1.0, so the scaling difference is
/// absorbed here and the pipeline always works in scheduler-space latents.
pub enum VaeKind {
    Kl(AutoEncoderKL),
    Tiny(Taesd),
}

impl VaeKind {
    /// Encode a `[-1, 1]` image tensor to scheduler-space latents.
    pub fn encode(&self, image: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Kl(vae) => {
                let dist = vae.encode(image)?;
                dist.sample()? * KL_SCALE_FACTOR
            }
            Self::Tiny(taesd) => taesd.encode(image),
        }
    }

    /// Decode scheduler-space latents to a `[-1, 1]` image tensor.
    pub fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Kl(vae) => vae.decode(&(latents / KL_SCALE_FACTOR)?),
            Self::Tiny(taesd) => taesd.decode(latents),
        }
    }
}
