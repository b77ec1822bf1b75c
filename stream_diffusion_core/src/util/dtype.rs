use std::fmt::Display;

use anyhow::Result;
use candle_core::{DType, Device};
use serde::Deserialize;
use tracing::info;

#[derive(Clone, Copy, Default, Debug, Deserialize, PartialEq, clap::ValueEnum)]
/// DType for the model.
///
/// Note: When using `Auto`, the fallback is F16 on accelerator devices and
/// F32 on the CPU.
pub enum ModelDType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

serde_plain::derive_fromstr_from_deserialize!(ModelDType);

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Type which can be converted to a DType.
pub trait TryIntoDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, _: &Device, silent: bool) -> Result<DType> {
        if !silent {
            info!("dtype selected is {self:?}.");
        }
        if !matches!(self, DType::BF16 | DType::F16 | DType::F32 | DType::F64) {
            anyhow::bail!("DType must be one of BF16, F16, F32, F64");
        }
        Ok(*self)
    }
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType> {
        let dtype = match self {
            Self::Auto => match device {
                Device::Cpu => DType::F32,
                _ => DType::F16,
            },
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        if !silent {
            info!("dtype selected is {dtype:?}.");
        }
        Ok(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolves_f32_on_cpu() {
        let dtype = ModelDType::Auto
            .try_into_dtype(&Device::Cpu, true)
            .unwrap();
        assert_eq!(dtype, DType::F32);
    }

    #[test]
    fn explicit_dtypes_pass_through() {
        assert_eq!(
            ModelDType::F16.try_into_dtype(&Device::Cpu, true).unwrap(),
            DType::F16
        );
        assert_eq!(
            ModelDType::BF16.try_into_dtype(&Device::Cpu, true).unwrap(),
            DType::BF16
        );
    }

    #[test]
    fn parses_from_str() {
        assert_eq!("f16".parse::<ModelDType>().unwrap(), ModelDType::F16);
        assert_eq!("auto".parse::<ModelDType>().unwrap(), ModelDType::Auto);
        assert!("f8".parse::<ModelDType>().is_err());
    }
}
