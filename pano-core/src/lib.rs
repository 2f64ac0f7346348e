pub mod cache;
pub mod config;
pub mod device_map;
pub mod error;
pub mod flux;
pub mod loader;
mod loader_factory;
mod util;

pub use cache::CacheSchedule;
pub use config::*;
pub use device_map::*;
pub use error::PanoramaError;
pub use flux::{FluxLoader, PanoramaGenerator};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub use util::{image_to_png, select_best_device, tensor_to_image};
pub(crate) use util::postprocess;

pub const DEFAULT_SEED: u64 = 42;

fn default_seed() -> u64 {
    DEFAULT_SEED
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The negative prompt, treating an empty one as absent.
    pub fn negative(&self) -> Option<&str> {
        self.negative_prompt.as_deref().filter(|p| !p.is_empty())
    }
}

/// A loaded pipeline. Generation mutates internal state, so callers hold
/// it exclusively for the duration of a request.
pub trait ModelLike: Send {
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}
