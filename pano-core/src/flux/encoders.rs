use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer};
use candle_transformers::models::t5::{self, T5EncoderModel};
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tracing::debug;

use super::sampling::Conditioning;

const CLIP_MAX_LEN: usize = 77;

#[derive(Debug, Clone)]
pub struct EncoderFiles {
    pub t5_model: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_model: PathBuf,
    pub clip_tokenizer: PathBuf,
}

fn clip_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: CLIP_MAX_LEN,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

/// T5 sequence embeddings plus the pooled CLIP vector.
pub struct TextEncoders {
    device: Device,
    dtype: DType,
    t5_max_len: usize,
    t5: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
}

impl TextEncoders {
    pub fn load(files: &EncoderFiles, t5_max_len: usize, dtype: DType, device: &Device) -> Result<Self> {
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.t5_model], dtype, device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5 = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.clip_model], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let clip = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config())
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(&files.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        Ok(Self {
            device: device.clone(),
            dtype,
            t5_max_len,
            t5,
            t5_tokenizer,
            clip,
            clip_tokenizer,
        })
    }

    pub fn encode(&mut self, prompt: &str) -> Result<Conditioning> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(self.t5_max_len, 0);
        let ids = Tensor::new(t5_tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5.forward(&ids)?.to_dtype(self.dtype)?;

        let clip_tokens = clip_window(
            self.clip_tokenizer
                .encode(prompt, true)
                .map_err(Error::msg)?
                .get_ids()
                .to_vec(),
        );
        let ids = Tensor::new(clip_tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip.forward(&ids)?.to_dtype(self.dtype)?;
        debug!(t5 = ?t5_emb.shape(), clip = ?clip_emb.shape(), "encoded prompt");

        Ok(Conditioning::new(t5_emb, clip_emb)?)
    }
}

/// Truncates CLIP ids to the position table while keeping the closing token,
/// which the pooled output is read from.
fn clip_window(mut tokens: Vec<u32>) -> Vec<u32> {
    if tokens.len() > CLIP_MAX_LEN {
        let eos = tokens[tokens.len() - 1];
        tokens.truncate(CLIP_MAX_LEN);
        tokens[CLIP_MAX_LEN - 1] = eos;
    }
    tokens
}
