use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use pano_core::{
    CacheSchedule, DeviceMap, GeneratorOptions, ModelSource, OffloadPolicy, OptimizationFlags,
    PanoramaConfig, TiledDecode, DEFAULT_SEED,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;

use app::{AppState, HubSource, LoadPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about = "Text-to-panorama generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "PANO_CPU")]
    cpu: bool,

    /// Device to run on: `cpu`, an ordinal, `cuda:<n>` or `metal:<n>`
    #[arg(long, env = "PANO_DEVICE", default_value = "0")]
    device: DeviceMap,

    /// Base FLUX model repository
    #[arg(long, env = "PANO_MODEL", default_value = "black-forest-labs/FLUX.1-dev")]
    model: String,

    /// Panorama adapter repository
    #[arg(long, env = "PANO_ADAPTER_REPO", default_value = "tencent/HunyuanWorld-1")]
    adapter_repo: String,

    #[arg(long, env = "PANO_ADAPTER_SUBFOLDER", default_value = "HunyuanWorld-PanoDiT-Text")]
    adapter_subfolder: String,

    #[arg(long, env = "PANO_ADAPTER_WEIGHT", default_value = "lora.safetensors")]
    adapter_weight: String,

    #[arg(long, env = "PANO_ADAPTER_STRENGTH", default_value_t = 1.0)]
    adapter_strength: f32,

    /// Generator lifecycle across requests
    #[arg(long, env = "PANO_LOAD_POLICY", value_enum, default_value_t = LoadPolicy::PerRequest)]
    load_policy: LoadPolicy,

    /// Module placement: `sequential` or `resident`
    #[arg(long, env = "PANO_OFFLOAD", default_value = "sequential")]
    offload: OffloadPolicy,

    /// 8-bit Q/K attention
    #[arg(long, env = "PANO_LOW_PRECISION_ATTENTION", default_value_t = true, action = ArgAction::Set)]
    low_precision_attention: bool,

    /// 8-bit transformer block weights
    #[arg(long, env = "PANO_LOW_PRECISION_GEMM", default_value_t = true, action = ArgAction::Set)]
    low_precision_gemm: bool,

    /// Reuse transformer block residuals between steps
    #[arg(long, env = "PANO_CACHE", default_value_t = true, action = ArgAction::Set)]
    cache: bool,

    /// Decode latents in overlapping tiles
    #[arg(long, env = "PANO_TILED_DECODE", default_value_t = true, action = ArgAction::Set)]
    tiled_decode: bool,

    #[arg(long, env = "PANO_STEPS", default_value_t = 50)]
    steps: usize,

    /// Seed used for every request
    #[arg(long, env = "PANO_SEED", default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Host address to bind the server to
    #[arg(long, env = "PANO_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PANO_PORT", default_value_t = 8000)]
    port: u16,
}

impl Args {
    fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            device_map: if self.cpu {
                DeviceMap::ForceCpu
            } else {
                self.device
            },
            source: ModelSource {
                base_repo: self.model.clone(),
                adapter_repo: self.adapter_repo.clone(),
                adapter_subfolder: self.adapter_subfolder.clone(),
                adapter_weight: self.adapter_weight.clone(),
                adapter_strength: self.adapter_strength,
            },
            config: PanoramaConfig {
                num_inference_steps: self.steps,
                tiled_decode: self.tiled_decode.then(TiledDecode::default),
                ..Default::default()
            },
            flags: OptimizationFlags {
                low_precision_attention: self.low_precision_attention,
                low_precision_gemm: self.low_precision_gemm,
                cache: self.cache,
            },
            offload: self.offload,
            cache_schedule: CacheSchedule::panorama(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let options = args.generator_options();
    options.validate()?;
    info!(
        model = args.model,
        adapter = args.adapter_repo,
        load_policy = ?args.load_policy,
        flags = ?options.flags,
        "starting panorama server"
    );

    let state = Arc::new(AppState::new(
        HubSource::new(options),
        args.load_policy,
        args.seed,
    ));
    let app = app::router(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
