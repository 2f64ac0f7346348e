use anyhow::Result;
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::flux::{self, FluxLoader};
use crate::{GeneratorOptions, Loader, ModelLike, PanoramaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from a hub repository name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();
        if !name_upper.contains("FLUX") {
            return None;
        }
        // The panorama adapter is trained against the guidance-distilled model.
        Some(ModelVariant::Flux(if name_upper.contains("SCHNELL") {
            flux::FluxVariant::Schnell
        } else {
            flux::FluxVariant::Dev
        }))
    }
}

/// Download the weights named by `options` and build a generator.
pub async fn load_model(api: Api, options: GeneratorOptions) -> Result<Box<dyn ModelLike>> {
    let base_repo = options.source.base_repo.clone();
    let variant = ModelVariant::from_name(&base_repo)
        .ok_or_else(|| PanoramaError::UnsupportedModel(base_repo.clone()))?;
    info!(model = base_repo, ?variant, adapter = options.source.adapter_repo, "loading model");

    match variant {
        ModelVariant::Flux(variant) => {
            let model = FluxLoader::load(variant, api, options).await?;
            Ok(Box::new(model))
        }
    }
}
