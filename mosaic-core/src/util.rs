use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result};
use tracing::warn;

use crate::Error;

pub fn select_best_device(ordinal: usize) -> Result<Device> {
    if cuda_is_available() {
        Device::new_cuda(ordinal)
    } else if metal_is_available() {
        Device::new_metal(ordinal)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            warn!(ordinal, "running on CPU, to run on GPU(metal) build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            warn!(ordinal, "running on CPU, to run on GPU build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Parse a precision string into a candle `DType`.
///
/// Accepts short and long forms: "f32"/"float32", "f16"/"float16", "bf16"/"bfloat16".
pub fn parse_dtype(s: &str) -> crate::Result<DType> {
    match s {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(Error::Config(format!("unknown dtype: '{other}'"))),
    }
}

/// Narrows a requested half-precision dtype to f32 on devices without native support.
pub fn effective_dtype(dtype: DType, device: &Device) -> DType {
    match (dtype, device) {
        (DType::BF16 | DType::F16, Device::Cpu) => DType::F32,
        _ => dtype,
    }
}
