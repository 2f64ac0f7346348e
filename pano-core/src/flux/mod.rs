use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux::autoencoder::{self, AutoEncoder};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, info_span};

pub mod attention;
pub mod encoders;
pub mod linear;
pub mod lora;
pub mod model;
pub mod sampling;
pub mod vae;

use encoders::{EncoderFiles, TextEncoders};
use linear::GemmPrecision;
use lora::LoraAdapter;
use model::{Execution, Flux};
use sampling::{Canvas, Conditioning, Guidance};

use crate::{
    postprocess, select_best_device, tensor_to_image, GenerationRequest, GeneratorOptions, Loader,
    ModelLike, OffloadPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Dev,
    Schnell,
}

impl FluxVariant {
    pub fn transformer_file(&self) -> &'static str {
        match self {
            Self::Dev => "flux1-dev.safetensors",
            Self::Schnell => "flux1-schnell.safetensors",
        }
    }

    pub fn config(&self) -> model::Config {
        match self {
            Self::Dev => model::Config::dev(),
            Self::Schnell => model::Config::schnell(),
        }
    }

    pub fn autoencoder_config(&self) -> autoencoder::Config {
        match self {
            Self::Dev => autoencoder::Config::dev(),
            Self::Schnell => autoencoder::Config::schnell(),
        }
    }

    /// Resolution-dependent timestep shift, only used by the guidance
    /// distilled variant.
    pub fn schedule(&self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            Self::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
            Self::Schnell => sampling::get_schedule(steps, None),
        }
    }
}

/// Local paths of every weight file the pipeline reads.
#[derive(Debug, Clone)]
pub struct WeightFiles {
    pub transformer: PathBuf,
    pub autoencoder: PathBuf,
    pub adapter: PathBuf,
    pub encoders: EncoderFiles,
}

impl WeightFiles {
    pub async fn fetch(api: &Api, options: &GeneratorOptions, variant: FluxVariant) -> Result<Self> {
        let source = &options.source;
        let base_repo = api.repo(hf_hub::Repo::model(source.base_repo.clone()));
        let transformer = base_repo
            .get(variant.transformer_file())
            .await
            .context("failed to get flux model file")?;
        let autoencoder = base_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let adapter = api
            .model(source.adapter_repo.clone())
            .get(&source.adapter_file())
            .await
            .with_context(|| format!("failed to get adapter {}", source.adapter_file()))?;

        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_config = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_tokenizer = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;

        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_tokenizer = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;

        Ok(Self {
            transformer,
            autoencoder,
            adapter,
            encoders: EncoderFiles {
                t5_model,
                t5_config,
                t5_tokenizer,
                clip_model,
                clip_tokenizer,
            },
        })
    }
}

enum Stages {
    /// Everything lives on the device.
    Resident {
        text: TextEncoders,
        transformer: Flux,
        autoencoder: AutoEncoder,
    },
    /// Only the fused transformer weights are kept, in host memory; each
    /// stage is built on the device when it runs and dropped afterwards.
    Sequential { transformer: HashMap<String, Tensor> },
}

/// Text-to-panorama pipeline: FLUX with the panorama adapter fused in.
pub struct PanoramaGenerator {
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    options: GeneratorOptions,
    files: WeightFiles,
    execution: Execution,
    stages: Stages,
}

fn build_transformer(
    weights: HashMap<String, Tensor>,
    variant: FluxVariant,
    execution: &Execution,
    dtype: DType,
    device: &Device,
) -> Result<Flux> {
    let vb = VarBuilder::from_tensors(weights, dtype, device);
    Flux::new(&variant.config(), execution, vb).context("failed to load flux model")
}

fn load_autoencoder(
    files: &WeightFiles,
    variant: FluxVariant,
    dtype: DType,
    device: &Device,
) -> Result<AutoEncoder> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[&files.autoencoder], dtype, device)
            .context("failed to build autoencoder var builder")?
    };
    AutoEncoder::new(&variant.autoencoder_config(), vb).context("failed to load autoencoder")
}

/// The negative prompt to encode, if true CFG will use it.
fn active_negative(request: &GenerationRequest, true_cfg_scale: f64) -> Option<&str> {
    let negative = request.negative()?;
    if true_cfg_scale <= 1.0 {
        debug!(true_cfg_scale, "true cfg disabled, ignoring negative prompt");
        return None;
    }
    Some(negative)
}

impl PanoramaGenerator {
    /// Reads the weights, fuses the adapter and prepares the stages.
    /// Blocking; run it off the async runtime.
    pub fn build(files: WeightFiles, options: GeneratorOptions, variant: FluxVariant) -> Result<Self> {
        options.validate()?;
        let device = select_best_device(options.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        let mut weights = candle_core::safetensors::load(&files.transformer, &Device::Cpu)
            .context("failed to read flux model weights")?;
        let adapter = LoraAdapter::load(&files.adapter, &options.source.adapter_repo)?;
        lora::fuse_into(
            &mut weights,
            adapter,
            &variant.config(),
            options.source.adapter_strength,
        )?;

        let execution = Execution {
            attention: attention::attention_backend(options.flags.low_precision_attention),
            gemm: if options.flags.low_precision_gemm {
                GemmPrecision::Q8
            } else {
                GemmPrecision::Full
            },
        };
        info!(
            attention = execution.attention.name(),
            gemm = ?execution.gemm,
            cache = options.flags.cache,
            offload = ?options.offload,
            "transformer execution configured"
        );

        let stages = match options.offload {
            OffloadPolicy::Resident => Stages::Resident {
                text: TextEncoders::load(&files.encoders, options.config.t5_max_len, dtype, &device)?,
                transformer: build_transformer(weights, variant, &execution, dtype, &device)?,
                autoencoder: load_autoencoder(&files, variant, dtype, &device)?,
            },
            OffloadPolicy::Sequential => Stages::Sequential { transformer: weights },
        };

        Ok(Self {
            device,
            dtype,
            variant,
            options,
            files,
            execution,
            stages,
        })
    }

    fn encode(&mut self, request: &GenerationRequest) -> Result<(Conditioning, Option<Conditioning>)> {
        let _span = info_span!("encode").entered();
        let negative = active_negative(request, self.options.config.true_cfg_scale);
        let mut loaded;
        let text = match &mut self.stages {
            Stages::Resident { text, .. } => text,
            Stages::Sequential { .. } => {
                loaded = TextEncoders::load(
                    &self.files.encoders,
                    self.options.config.t5_max_len,
                    self.dtype,
                    &self.device,
                )?;
                &mut loaded
            }
        };
        let cond = text.encode(&request.prompt)?;
        let uncond = negative.map(|prompt| text.encode(prompt)).transpose()?;
        Ok((cond, uncond))
    }

    fn denoise(&self, canvas: &Canvas, noise: &Tensor, guidance: &Guidance) -> Result<Tensor> {
        let _span = info_span!("denoise").entered();
        let config = &self.options.config;
        let timesteps = self
            .variant
            .schedule(config.num_inference_steps, canvas.image_seq_len());
        let cache = self
            .options
            .flags
            .cache
            .then_some(&self.options.cache_schedule);
        let latents = match &self.stages {
            Stages::Resident { transformer, .. } => {
                sampling::denoise(transformer, canvas, noise, guidance, &timesteps, cache)?
            }
            Stages::Sequential { transformer } => {
                let transformer = build_transformer(
                    transformer.clone(),
                    self.variant,
                    &self.execution,
                    self.dtype,
                    &self.device,
                )?;
                sampling::denoise(&transformer, canvas, noise, guidance, &timesteps, cache)?
            }
        };
        Ok(latents)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let _span = info_span!("decode").entered();
        let tiling = self.options.config.tiled_decode;
        let decoded = match &self.stages {
            Stages::Resident { autoencoder, .. } => vae::decode(autoencoder, latents, tiling)?,
            Stages::Sequential { .. } => {
                let autoencoder = load_autoencoder(&self.files, self.variant, self.dtype, &self.device)?;
                vae::decode(&autoencoder, latents, tiling)?
            }
        };
        Ok(decoded)
    }
}

impl ModelLike for PanoramaGenerator {
    fn run(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
        let config = self.options.config.clone();
        info!(
            prompt = %request.prompt,
            seed = request.seed,
            steps = config.num_inference_steps,
            "generating panorama"
        );

        let (cond, uncond) = self.encode(request)?;
        let guidance = Guidance {
            cond: &cond,
            uncond: uncond.as_ref(),
            true_cfg_scale: config.true_cfg_scale,
            guidance: config.guidance_scale,
        };

        let canvas = Canvas::new(&config);
        let noise = sampling::seeded_noise(
            request.seed,
            (1, 16, canvas.height, canvas.total_width()),
            &self.device,
            self.dtype,
        )?;
        let latents = self.denoise(&canvas, &noise, &guidance)?;
        let decoded = self.decode(&latents)?;

        let decoded = sampling::close_pixel_seam(&decoded, config.width, config.blend_extend * 8)?;
        let img = postprocess(&decoded)?;
        tensor_to_image(&img)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = PanoramaGenerator;

    async fn load(variant: FluxVariant, api: Api, options: GeneratorOptions) -> Result<Self::Model> {
        options.validate()?;
        let files = WeightFiles::fetch(&api, &options, variant).await?;
        info!(transformer = %files.transformer.display(), "weights available locally");
        tokio::task::spawn_blocking(move || PanoramaGenerator::build(files, options, variant))
            .await
            .context("generator build task failed")?
    }
}
