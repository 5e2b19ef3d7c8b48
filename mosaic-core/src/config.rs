//! Configuration for the sampling pipeline
//!
//! A [`PipelineConfig`] names the three models, the device map and the
//! default sampling settings. It can be read from YAML or JSON; every field
//! has a default so a partial file is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DeviceMap, Error, Result};

/// What to do with the extra images when `n_predictions` is not a multiple
/// of the device count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExcessPolicy {
    /// Return every image the padded rounds produced.
    #[default]
    Keep,
    /// Drop the images past `n_predictions`, in production order.
    Truncate,
}

serde_plain::derive_display_from_serialize!(ExcessPolicy);
serde_plain::derive_fromstr_from_deserialize!(ExcessPolicy);

/// Sampling hyperparameters for one request.
///
/// `None` leaves the choice to the generator's own default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default)]
    pub top_k: Option<usize>,

    #[serde(default)]
    pub top_p: Option<f64>,

    #[serde(default)]
    pub temperature: Option<f64>,

    /// Conditioning strength toward the prompt
    #[serde(default = "default_condition_scale")]
    pub condition_scale: f64,

    /// Requested number of images per prompt
    #[serde(default = "default_n_predictions")]
    pub n_predictions: usize,

    /// Run seed (None = random 32-bit)
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub excess: ExcessPolicy,

    /// Rank the images with the scorer when one is loaded
    #[serde(default = "default_true")]
    pub score: bool,
}

fn default_condition_scale() -> f64 {
    3.0
}

fn default_n_predictions() -> usize {
    8
}

fn default_true() -> bool {
    true
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: None,
            top_p: None,
            temperature: None,
            condition_scale: default_condition_scale(),
            n_predictions: default_n_predictions(),
            seed: None,
            excess: ExcessPolicy::default(),
            score: true,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_predictions == 0 {
            return Err(Error::Config("n_predictions must be greater than 0".into()));
        }
        if let Some(top_k) = self.top_k {
            if top_k == 0 {
                return Err(Error::Config("top_k must be greater than 0".into()));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(Error::Config(format!("top_p must be in (0, 1], got {top_p}")));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(temperature > 0.0 && temperature.is_finite()) {
                return Err(Error::Config(format!(
                    "temperature must be positive, got {temperature}"
                )));
            }
        }
        if !self.condition_scale.is_finite() {
            return Err(Error::Config("condition_scale must be finite".into()));
        }
        Ok(())
    }
}

/// One model to resolve: identifier (with optional `:revision`) and precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,

    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    "f32".to_string()
}

impl ModelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dtype: default_dtype(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_generator")]
    pub generator: ModelConfig,

    #[serde(default = "default_decoder")]
    pub decoder: ModelConfig,

    /// Similarity model; `None` disables ranking
    #[serde(default = "default_scorer")]
    pub scorer: Option<ModelConfig>,
}

fn default_generator() -> ModelConfig {
    ModelConfig::new("dalle-mini/dalle-mini/mega-1-fp16:latest")
}

fn default_decoder() -> ModelConfig {
    ModelConfig::new("dalle-mini/vqgan_imagenet_f16_16384")
}

fn default_scorer() -> Option<ModelConfig> {
    Some(ModelConfig::new("openai/clip-vit-base-patch32:refs/pr/15"))
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            decoder: default_decoder(),
            scorer: default_scorer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub devices: DeviceMap,

    /// Root of the local versioned artifact store
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    /// Fixed prompt length after padding/truncation
    #[serde(default = "default_prompt_max_length")]
    pub prompt_max_length: usize,

    /// Image tokens per sample, not counting the leading control token
    #[serde(default = "default_image_token_count")]
    pub image_token_count: usize,

    /// Side of the square output images
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    #[serde(default)]
    pub sampling: SamplingParams,
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_prompt_max_length() -> usize {
    64
}

fn default_image_token_count() -> usize {
    256
}

fn default_image_size() -> usize {
    256
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            devices: DeviceMap::default(),
            artifact_root: default_artifact_root(),
            prompt_max_length: default_prompt_max_length(),
            image_token_count: default_image_token_count(),
            image_size: default_image_size(),
            sampling: SamplingParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load by file extension, `.json` or YAML otherwise.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path),
            _ => Self::from_yaml(path),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::Config("at least one device is required".into()));
        }
        if self.prompt_max_length == 0 || self.image_token_count == 0 || self.image_size == 0 {
            return Err(Error::Config(
                "prompt_max_length, image_token_count and image_size must be non-zero".into(),
            ));
        }
        self.sampling.validate()
    }
}
