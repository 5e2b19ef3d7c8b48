//! Fixed-shape prompt tokenization

use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::debug;

use crate::{Error, Result};

const PAD_CANDIDATES: [&str; 3] = ["<pad>", "[PAD]", "<|endoftext|>"];

/// Token ids and attention mask for one or more prompts, `max_length` wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPrompt {
    input_ids: Vec<Vec<u32>>,
    attention_mask: Vec<Vec<u32>>,
    max_length: usize,
}

/// A [`TokenizedPrompt`] copied onto one device.
#[derive(Debug, Clone)]
pub struct PromptTensors {
    /// `(rows, max_length)` u32
    pub input_ids: Tensor,
    /// `(rows, max_length)` u32, 1 for real tokens
    pub attention_mask: Tensor,
}

impl TokenizedPrompt {
    pub fn rows(&self) -> usize {
        self.input_ids.len()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn input_ids(&self) -> &[Vec<u32>] {
        &self.input_ids
    }

    pub fn attention_mask(&self) -> &[Vec<u32>] {
        &self.attention_mask
    }

    /// The ids of `row` that the attention mask keeps.
    pub fn non_padding_tokens(&self, row: usize) -> Vec<u32> {
        self.input_ids[row]
            .iter()
            .zip(&self.attention_mask[row])
            .filter(|(_, mask)| **mask == 1)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn to_device(&self, device: &Device) -> Result<PromptTensors> {
        Ok(PromptTensors {
            input_ids: Tensor::new(self.input_ids.clone(), device)?,
            attention_mask: Tensor::new(self.attention_mask.clone(), device)?,
        })
    }

    /// One identical copy per device, in device order.
    pub fn replicate(&self, devices: &[Device]) -> Result<Vec<PromptTensors>> {
        devices.iter().map(|d| self.to_device(d)).collect()
    }
}

pub struct PromptEncoder {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl PromptEncoder {
    pub fn from_file<P: AsRef<Path>>(path: P, max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| Error::Tokenize(e.to_string()))?;
        Self::new(tokenizer, max_length)
    }

    /// Configures `tokenizer` to truncate and pad to exactly `max_length`.
    pub fn new(tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        let pad_token = PAD_CANDIDATES
            .iter()
            .find(|t| tokenizer.token_to_id(t).is_some())
            .map(|t| t.to_string())
            .ok_or_else(|| Error::Tokenize("tokenizer has no padding token".into()))?;
        Self::with_pad_token(tokenizer, max_length, &pad_token)
    }

    pub fn with_pad_token(mut tokenizer: Tokenizer, max_length: usize, pad_token: &str) -> Result<Self> {
        if max_length == 0 {
            return Err(Error::Config("prompt max length must be non-zero".into()));
        }
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .ok_or_else(|| Error::Tokenize(format!("unknown padding token `{pad_token}`")))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| Error::Tokenize(e.to_string()))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            direction: PaddingDirection::Right,
            pad_id,
            pad_token: pad_token.to_string(),
            ..Default::default()
        }));
        Ok(Self {
            tokenizer,
            max_length,
        })
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn encode<S: AsRef<str>>(&self, prompts: &[S]) -> Result<TokenizedPrompt> {
        if prompts.is_empty() {
            return Err(Error::Tokenize("at least one prompt is required".into()));
        }
        let inputs: Vec<&str> = prompts.iter().map(AsRef::as_ref).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| Error::Tokenize(e.to_string()))?;
        let mut input_ids = Vec::with_capacity(encodings.len());
        let mut attention_mask = Vec::with_capacity(encodings.len());
        for encoding in encodings {
            input_ids.push(encoding.get_ids().to_vec());
            attention_mask.push(encoding.get_attention_mask().to_vec());
        }
        debug!(rows = input_ids.len(), max_length = self.max_length, "encoded prompts");
        Ok(TokenizedPrompt {
            input_ids,
            attention_mask,
            max_length: self.max_length,
        })
    }
}
