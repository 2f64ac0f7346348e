use serde::{Deserialize, Serialize};

use crate::{cache::CacheSchedule, DeviceMap, PanoramaError};

/// Sampling parameters fixed for the lifetime of one generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanoramaConfig {
    pub height: usize,
    pub width: usize,
    /// Distilled guidance fed to the transformer's guidance embedder.
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    /// Classifier-free guidance against the negative prompt, active above 1.0.
    pub true_cfg_scale: f64,
    /// Latent columns blended across the left/right seam.
    pub blend_extend: usize,
    /// Latent columns the canvas is rolled by before every step.
    pub shifting_extend: usize,
    pub t5_max_len: usize,
    pub tiled_decode: Option<TiledDecode>,
}

impl Default for PanoramaConfig {
    fn default() -> Self {
        Self {
            height: 960,
            width: 1920,
            guidance_scale: 30.0,
            num_inference_steps: 50,
            true_cfg_scale: 0.0,
            blend_extend: 6,
            shifting_extend: 0,
            t5_max_len: 512,
            tiled_decode: Some(TiledDecode::default()),
        }
    }
}

impl PanoramaConfig {
    pub fn validate(&self) -> Result<(), PanoramaError> {
        let ok = |v: usize| v > 0 && v % 16 == 0;
        if !ok(self.width) || !ok(self.height) {
            return Err(PanoramaError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.blend_extend > self.latent_width() {
            return Err(PanoramaError::BlendTooWide {
                blend: self.blend_extend,
                width: self.latent_width(),
            });
        }
        if self.num_inference_steps == 0 {
            return Err(PanoramaError::NoSteps);
        }
        if let Some(TiledDecode { tile_size, overlap }) = self.tiled_decode {
            if tile_size == 0 || overlap >= tile_size {
                return Err(PanoramaError::InvalidTiling { tile_size, overlap });
            }
        }
        Ok(())
    }

    pub fn latent_height(&self) -> usize {
        self.height / 8
    }

    pub fn latent_width(&self) -> usize {
        self.width / 8
    }
}

/// Overlapping-tile VAE decoding, sizes in latent pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiledDecode {
    pub tile_size: usize,
    pub overlap: usize,
}

impl Default for TiledDecode {
    fn default() -> Self {
        Self {
            tile_size: 64,
            overlap: 16,
        }
    }
}

/// Optional compute/memory trade-offs applied at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationFlags {
    pub low_precision_attention: bool,
    pub low_precision_gemm: bool,
    pub cache: bool,
}

impl OptimizationFlags {
    pub fn all() -> Self {
        Self {
            low_precision_attention: true,
            low_precision_gemm: true,
            cache: true,
        }
    }
}

/// Hub identifiers for the base model and the panorama adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSource {
    pub base_repo: String,
    pub adapter_repo: String,
    pub adapter_subfolder: String,
    pub adapter_weight: String,
    pub adapter_strength: f32,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            base_repo: "black-forest-labs/FLUX.1-dev".to_string(),
            adapter_repo: "tencent/HunyuanWorld-1".to_string(),
            adapter_subfolder: "HunyuanWorld-PanoDiT-Text".to_string(),
            adapter_weight: "lora.safetensors".to_string(),
            adapter_strength: 1.0,
        }
    }
}

impl ModelSource {
    pub fn adapter_file(&self) -> String {
        if self.adapter_subfolder.is_empty() {
            self.adapter_weight.clone()
        } else {
            format!("{}/{}", self.adapter_subfolder, self.adapter_weight)
        }
    }
}

/// Placement of modules between host memory and the compute device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffloadPolicy {
    /// Instantiate each stage on the device only while it runs.
    #[default]
    Sequential,
    /// Keep every module on the device for the generator's lifetime.
    Resident,
}

impl std::str::FromStr for OffloadPolicy {
    type Err = PanoramaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "resident" => Ok(Self::Resident),
            other => Err(PanoramaError::InvalidOffload(other.to_string())),
        }
    }
}

/// Everything needed to build a generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    pub device_map: DeviceMap,
    pub source: ModelSource,
    pub config: PanoramaConfig,
    pub flags: OptimizationFlags,
    pub offload: OffloadPolicy,
    pub cache_schedule: CacheSchedule,
}

impl GeneratorOptions {
    pub fn validate(&self) -> Result<(), PanoramaError> {
        self.config.validate()?;
        // Cached residuals are tied to token positions, which a rolling
        // canvas moves between steps.
        if self.flags.cache && self.config.shifting_extend > 0 {
            return Err(PanoramaError::CacheWithShift(self.config.shifting_extend));
        }
        Ok(())
    }
}
