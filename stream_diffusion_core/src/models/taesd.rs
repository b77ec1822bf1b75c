//! Tiny autoencoder (TAESD), a distilled drop-in replacement for the KL VAE.
//!
//! Matches the diffusers `AutoencoderTiny` layout: sequential conv stacks
//! with ReLU residual blocks, stride-2 downsampling in the encoder and
//! nearest-neighbor upsampling in the decoder. The scaling factor is 1.0, so
//! the pipeline feeds it scheduler-space latents directly.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

const CHANNELS: usize = 64;
const LATENT_CHANNELS: usize = 4;
const ENCODER_BLOCKS: [usize; 4] = [1, 3, 3, 3];
const DECODER_BLOCKS: [usize; 4] = [3, 3, 3, 1];

fn conv3x3(in_c: usize, out_c: usize, stride: usize, bias: bool, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    if bias {
        conv2d(in_c, out_c, 3, cfg, vb)
    } else {
        conv2d_no_bias(in_c, out_c, 3, cfg, vb)
    }
}

/// conv-relu-conv-relu-conv residual block, fused with a trailing ReLU.
struct Block {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    skip: Option<Conv2d>,
}

impl Block {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let conv = vb.pp("conv");
        let conv1 = conv3x3(in_c, out_c, 1, true, conv.pp("0"))?;
        let conv2 = conv3x3(out_c, out_c, 1, true, conv.pp("2"))?;
        let conv3 = conv3x3(out_c, out_c, 1, true, conv.pp("4"))?;
        let skip = if in_c != out_c {
            Some(conv2d_no_bias(
                in_c,
                out_c,
                1,
                Conv2dConfig::default(),
                vb.pp("skip"),
            )?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            conv3,
            skip,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .relu()?
            .apply(&self.conv2)?
            .relu()?
            .apply(&self.conv3)?;
        let skip = match &self.skip {
            Some(conv) => xs.apply(conv)?,
            None => xs.clone(),
        };
        (ys + skip)?.relu()
    }
}

enum Layer {
    Conv(Conv2d),
    Block(Block),
    Relu,
    Upsample,
}

impl Layer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(conv) => xs.apply(conv),
            Self::Block(block) => block.forward(xs),
            Self::Relu => xs.relu(),
            Self::Upsample => {
                let (_b, _c, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(h * 2, w * 2)
            }
        }
    }
}

struct Stack {
    layers: Vec<Layer>,
}

impl Module for Stack {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

fn encoder(vb: VarBuilder) -> Result<Stack> {
    let vb = vb.pp("layers");
    let mut layers = Vec::new();
    let mut idx = 0usize;
    for (i, num_blocks) in ENCODER_BLOCKS.iter().enumerate() {
        if i == 0 {
            layers.push(Layer::Conv(conv3x3(3, CHANNELS, 1, true, vb.pp(idx.to_string()))?));
        } else {
            layers.push(Layer::Conv(conv3x3(
                CHANNELS,
                CHANNELS,
                2,
                false,
                vb.pp(idx.to_string()),
            )?));
        }
        idx += 1;
        for _ in 0..*num_blocks {
            layers.push(Layer::Block(Block::new(
                CHANNELS,
                CHANNELS,
                vb.pp(idx.to_string()),
            )?));
            idx += 1;
        }
    }
    layers.push(Layer::Conv(conv3x3(
        CHANNELS,
        LATENT_CHANNELS,
        1,
        true,
        vb.pp(idx.to_string()),
    )?));
    Ok(Stack { layers })
}

fn decoder(vb: VarBuilder) -> Result<Stack> {
    let vb = vb.pp("layers");
    let mut layers = Vec::new();
    layers.push(Layer::Conv(conv3x3(
        LATENT_CHANNELS,
        CHANNELS,
        1,
        true,
        vb.pp("0"),
    )?));
    layers.push(Layer::Relu);
    let mut idx = 2usize;
    for (i, num_blocks) in DECODER_BLOCKS.iter().enumerate() {
        let is_final = i == DECODER_BLOCKS.len() - 1;
        for _ in 0..*num_blocks {
            layers.push(Layer::Block(Block::new(
                CHANNELS,
                CHANNELS,
                vb.pp(idx.to_string()),
            )?));
            idx += 1;
        }
        if !is_final {
            layers.push(Layer::Upsample);
            idx += 1;
            layers.push(Layer::Conv(conv3x3(
                CHANNELS,
                CHANNELS,
                1,
                false,
                vb.pp(idx.to_string()),
            )?));
            idx += 1;
        } else {
            layers.push(Layer::Conv(conv3x3(
                CHANNELS,
                3,
                1,
                true,
                vb.pp(idx.to_string()),
            )?));
            idx += 1;
        }
    }
    Ok(Stack { layers })
}

pub struct Taesd {
    encoder: Stack,
    decoder: Stack,
}

impl Taesd {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: encoder(vb.pp("encoder"))?,
            decoder: decoder(vb.pp("decoder"))?,
        })
    }

    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        self.encoder.forward(xs)
    }

    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        // Soft-clamp the latents to roughly +-3 before decoding.
        let clamped = ((latents / 3.0)?.tanh()? * 3.0)?;
        self.decoder.forward(&clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn encode_decode_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let taesd = Taesd::new(vb)?;

        let image = Tensor::zeros((1, 3, 64, 64), DType::F32, &device)?;
        let latents = taesd.encode(&image)?;
        assert_eq!(latents.dims4()?, (1, 4, 8, 8));

        let decoded = taesd.decode(&latents)?;
        assert_eq!(decoded.dims4()?, (1, 3, 64, 64));
        Ok(())
    }

    #[test]
    fn decoder_clamp_bounds_latents() -> Result<()> {
        let device = Device::Cpu;
        let latents = Tensor::new(&[100f32, -100f32, 0f32], &device)?;
        let clamped = ((&latents / 3.0)?.tanh()? * 3.0)?;
        let values = clamped.to_vec1::<f32>()?;
        assert!(values[0] <= 3.0 && values[1] >= -3.0);
        assert_eq!(values[2], 0.0);
        Ok(())
    }
}
