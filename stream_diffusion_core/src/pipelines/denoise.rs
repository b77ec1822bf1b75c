//! The denoising loop over the resolved sub-schedule.

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;

use super::UNetModel;

/// Run the UNet/scheduler loop across `sub_timesteps`.
///
/// `text_embeddings` must already be batched for classifier-free guidance
/// (unconditional embeddings first) when `guidance_scale > 1.0`.
pub(crate) fn denoise(
    unet: &UNetModel,
    scheduler: &mut dyn Scheduler,
    mut latents: Tensor,
    sub_timesteps: &[usize],
    text_embeddings: &Tensor,
    guidance_scale: f64,
) -> Result<Tensor> {
    let use_guidance = guidance_scale > 1.0;
    for &timestep in sub_timesteps {
        let latent_input = if use_guidance {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let latent_input = scheduler.scale_model_input(latent_input, timestep)?;

        let noise_pred = unet.forward(&latent_input, timestep as f64, text_embeddings)?;

        let noise_pred = if use_guidance {
            let chunks = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&chunks[0], &chunks[1]);
            (uncond + ((cond - uncond)? * guidance_scale)?)?
        } else {
            noise_pred
        };

        latents = scheduler.step(&noise_pred, timestep, &latents)?;
    }
    Ok(latents)
}
