use candle_core::{DType, Device};
use tracing::info;

use crate::{
    load_replicated, parse_dtype, ClipLoader, Decoder, Error, Generator, Loader, ModelConfig,
    ModelFiles, ModelHandle, Pipeline, PipelineConfig, PromptEncoder, Resolver, Result, Scorer,
};

/// Tokenizer shipped next to the generator weights.
pub const PROMPT_TOKENIZER: &str = "tokenizer.json";

/// Role of a model in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Generator,
    Decoder,
    Scorer,
}

impl ModelRole {
    /// Files a backend for this role needs resolved before loading.
    pub fn required_files(self) -> Vec<&'static str> {
        match self {
            ModelRole::Generator => {
                let mut files = vec![PROMPT_TOKENIZER];
                files.extend_from_slice(generator_backend_files());
                files
            }
            ModelRole::Decoder => decoder_backend_files().to_vec(),
            ModelRole::Scorer => ClipLoader::FILES.to_vec(),
        }
    }
}

/// Enum of supported scorer architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerType {
    Clip,
    // Add more scorer types as they become available
}

impl ScorerType {
    /// Detect scorer type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        if model_name.to_uppercase().contains("CLIP") {
            Some(ScorerType::Clip)
        } else {
            None
        }
    }
}

#[cfg(feature = "onnx")]
fn generator_backend_files() -> &'static [&'static str] {
    crate::OnnxGeneratorLoader::FILES
}

#[cfg(not(feature = "onnx"))]
fn generator_backend_files() -> &'static [&'static str] {
    &[]
}

#[cfg(feature = "onnx")]
fn decoder_backend_files() -> &'static [&'static str] {
    crate::OnnxDecoderLoader::FILES
}

#[cfg(not(feature = "onnx"))]
fn decoder_backend_files() -> &'static [&'static str] {
    &[]
}

#[cfg(feature = "onnx")]
pub fn load_generator(
    files: &ModelFiles,
    dtype: DType,
    devices: &[Device],
) -> Result<ModelHandle<dyn Generator>> {
    let handle = load_replicated::<crate::OnnxGeneratorLoader>(files, dtype, devices)?;
    Ok(handle.boxed(|m| m as Box<dyn Generator>))
}

#[cfg(not(feature = "onnx"))]
pub fn load_generator(
    files: &ModelFiles,
    _dtype: DType,
    _devices: &[Device],
) -> Result<ModelHandle<dyn Generator>> {
    Err(Error::load(
        &files.identifier,
        "no generator backend compiled in, rebuild with `--features onnx`",
    ))
}

#[cfg(feature = "onnx")]
pub fn load_decoder(
    files: &ModelFiles,
    dtype: DType,
    devices: &[Device],
) -> Result<ModelHandle<dyn Decoder>> {
    let handle = load_replicated::<crate::OnnxDecoderLoader>(files, dtype, devices)?;
    Ok(handle.boxed(|m| m as Box<dyn Decoder>))
}

#[cfg(not(feature = "onnx"))]
pub fn load_decoder(
    files: &ModelFiles,
    _dtype: DType,
    _devices: &[Device],
) -> Result<ModelHandle<dyn Decoder>> {
    Err(Error::load(
        &files.identifier,
        "no decoder backend compiled in, rebuild with `--features onnx`",
    ))
}

pub fn load_scorer(
    files: &ModelFiles,
    dtype: DType,
    devices: &[Device],
) -> Result<ModelHandle<dyn Scorer>> {
    match ScorerType::from_name(&files.identifier) {
        Some(ScorerType::Clip) => {
            let handle = load_replicated::<ClipLoader>(files, dtype, devices)?;
            Ok(handle.boxed(|m| m as Box<dyn Scorer>))
        }
        None => Err(Error::resolution(
            &files.identifier,
            "unsupported scorer type, expected a CLIP model",
        )),
    }
}

/// Resolved files for every model the pipeline needs.
#[derive(Debug, Clone)]
pub struct ResolvedModels {
    pub generator: ModelFiles,
    pub decoder: ModelFiles,
    pub scorer: Option<ModelFiles>,
}

/// Resolves all models up front, so an unknown identifier fails before
/// anything is loaded or run on a device.
pub async fn resolve_models(config: &PipelineConfig, resolver: &Resolver) -> Result<ResolvedModels> {
    let models = &config.models;
    if let Some(scorer) = &models.scorer {
        if ScorerType::from_name(&scorer.id).is_none() {
            return Err(Error::resolution(
                &scorer.id,
                "unsupported scorer type, expected a CLIP model",
            ));
        }
    }
    let generator = resolver
        .resolve(&models.generator.id, &ModelRole::Generator.required_files())
        .await?;
    let decoder = resolver
        .resolve(&models.decoder.id, &ModelRole::Decoder.required_files())
        .await?;
    let scorer = match &models.scorer {
        Some(scorer) => Some(
            resolver
                .resolve(&scorer.id, &ModelRole::Scorer.required_files())
                .await?,
        ),
        None => None,
    };
    Ok(ResolvedModels {
        generator,
        decoder,
        scorer,
    })
}

fn dtype_of(model: &ModelConfig) -> Result<DType> {
    parse_dtype(&model.dtype)
}

/// Resolve, load and replicate every model named by `config`.
pub async fn load_pipeline(config: &PipelineConfig, resolver: &Resolver) -> Result<Pipeline> {
    config.validate()?;
    let resolved = resolve_models(config, resolver).await?;
    let devices = config.devices.devices()?;
    info!(devices = devices.len(), map = %config.devices, "loading pipeline");

    let models = &config.models;
    let encoder = PromptEncoder::from_file(
        resolved.generator.get(PROMPT_TOKENIZER)?,
        config.prompt_max_length,
    )?;
    let generator = load_generator(&resolved.generator, dtype_of(&models.generator)?, &devices)?;
    let decoder = load_decoder(&resolved.decoder, dtype_of(&models.decoder)?, &devices)?;
    let scorer = match (&resolved.scorer, &models.scorer) {
        (Some(files), Some(model)) => Some(load_scorer(files, dtype_of(model)?, &devices)?),
        _ => None,
    };

    Ok(Pipeline::new(generator, decoder, scorer, encoder, devices)?
        .with_image_shape(config.image_token_count, config.image_size))
}
