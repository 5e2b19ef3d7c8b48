use anyhow::{anyhow, bail, Context, Error, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::imageops::FilterType;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{DecodedImage, Loader, ModelFiles, Scorer};

const WEIGHTS: &str = "model.safetensors";
const TOKENIZER: &str = "tokenizer.json";
const END_OF_TEXT: &str = "<|endoftext|>";

/// CLIP similarity between one prompt and a batch of images.
pub struct ClipScorer {
    device: Device,
    dtype: DType,
    model: ClipModel,
    tokenizer: Tokenizer,
    image_size: usize,
    max_tokens: usize,
    eot_id: u32,
}

impl ClipScorer {
    /// Prompt ids truncated to the text tower's context, keeping the final
    /// end-of-text token the pooled output is read from.
    fn prompt_ids(&self, prompt: &str) -> Result<Tensor> {
        let mut ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        truncate_keeping_last(&mut ids, self.max_tokens, self.eot_id);
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Resizes and crops to the vision tower resolution, scaled to [-1, 1].
    fn pixel_values(&self, images: &[DecodedImage]) -> Result<Tensor> {
        let size = self.image_size;
        let tensors = images
            .iter()
            .map(|image| {
                let img = image
                    .to_dynamic()
                    .resize_to_fill(size as u32, size as u32, FilterType::Triangle)
                    .to_rgb8()
                    .into_raw();
                Tensor::from_vec(img, (size, size, 3), &Device::Cpu)?
                    .permute((2, 0, 1))?
                    .to_dtype(DType::F32)?
                    .affine(2. / 255., -1.)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&tensors, 0)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?)
    }
}

impl Scorer for ClipScorer {
    fn score(&self, prompt: &str, images: &[DecodedImage]) -> Result<Vec<f32>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let input_ids = self.prompt_ids(prompt)?;
        let pixel_values = self.pixel_values(images)?;
        let (_logits_per_text, logits_per_image) = self.model.forward(&pixel_values, &input_ids)?;
        let scores = logits_per_image
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        debug!(images = images.len(), "clip scores computed");
        Ok(scores)
    }
}

/// Cuts `ids` to `max_tokens`, ending on `last` when anything was dropped.
fn truncate_keeping_last(ids: &mut Vec<u32>, max_tokens: usize, last: u32) {
    if ids.len() > max_tokens && max_tokens > 0 {
        ids.truncate(max_tokens - 1);
        ids.push(last);
    }
}

/// Rejects checkpoints that are not a two-tower float CLIP model before any
/// tensor is materialized.
fn check_checkpoint(path: &std::path::Path) -> Result<()> {
    let tensors = unsafe { MmapedSafetensors::new(path)? };
    let tensors = tensors.tensors();
    for tower in ["text_model.", "vision_model."] {
        if !tensors.iter().any(|(name, _)| name.starts_with(tower)) {
            bail!("checkpoint has no `{tower}*` tensors, not a CLIP model");
        }
    }
    for (name, view) in &tensors {
        match DType::try_from(view.dtype()) {
            Ok(dtype) if dtype.is_float() => {}
            _ => bail!("tensor `{name}` has unsupported dtype {:?}", view.dtype()),
        }
    }
    Ok(())
}

pub struct ClipLoader;

impl Loader for ClipLoader {
    type Model = ClipScorer;

    const FILES: &'static [&'static str] = &[WEIGHTS, TOKENIZER];

    fn load(files: &ModelFiles, dtype: DType, device: &Device) -> Result<Self::Model> {
        let weights = files.get(WEIGHTS)?;
        check_checkpoint(weights).context("failed to inspect CLIP checkpoint")?;

        let config = ClipConfig::vit_base_patch32();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let model = ClipModel::new(vb, &config).context("failed to load CLIP model")?;

        let tokenizer = Tokenizer::from_file(files.get(TOKENIZER)?)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let eot_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| anyhow!("CLIP tokenizer has no `{END_OF_TEXT}` token"))?;

        Ok(ClipScorer {
            device: device.clone(),
            dtype,
            model,
            tokenizer,
            image_size: config.image_size,
            max_tokens: config.text_config.max_position_embeddings,
            eot_id,
        })
    }
}
