pub mod config;
pub mod decoded;
pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
pub mod pipeline;
pub mod prompt;
pub mod rank;
pub mod sampling;
pub mod seed;
pub mod source;
mod util;

mod clip;
#[cfg(feature = "onnx")]
mod onnx;

use candle_core::Tensor;

pub use clip::{ClipLoader, ClipScorer};
pub use config::{ExcessPolicy, ModelConfig, ModelsConfig, PipelineConfig, SamplingParams};
pub use decoded::DecodedImage;
pub use device_map::*;
pub use error::{Error, Result};
pub use loader::*;
pub use loader_factory::*;
#[cfg(feature = "onnx")]
pub use onnx::{OnnxDecoder, OnnxDecoderLoader, OnnxGenerator, OnnxGeneratorLoader};
pub use pipeline::{Generation, Pipeline};
pub use prompt::{PromptEncoder, PromptTensors, TokenizedPrompt};
pub use rank::{format_score, rank, ScoredImage};
pub use sampling::{strip_control_token, Sampler, SamplingFailure, Samples};
pub use seed::SeedState;
pub use source::{ModelFiles, ModelSource, Resolver};
pub use util::*;

/// Text-to-image token generator, one replica per device.
pub trait Generator: Send + Sync {
    /// Samples image tokens for every prompt row.
    ///
    /// Returns a `(rows, 1 + image_token_count)` u32 tensor whose first
    /// column is the control token.
    fn generate(
        &self,
        prompt: &PromptTensors,
        seed: u64,
        params: &SamplingParams,
    ) -> anyhow::Result<Tensor>;
}

/// Image-token decoder, one replica per device.
pub trait Decoder: Send + Sync {
    /// Maps `(rows, image_token_count)` ids to channel-last pixels,
    /// `(rows, height, width, 3)` or any shape with that element count.
    fn decode(&self, tokens: &Tensor) -> anyhow::Result<Tensor>;
}

/// Text-image similarity model, one replica per device.
pub trait Scorer: Send + Sync {
    /// One score per image, higher meaning closer to `prompt`.
    fn score(&self, prompt: &str, images: &[DecodedImage]) -> anyhow::Result<Vec<f32>>;
}
