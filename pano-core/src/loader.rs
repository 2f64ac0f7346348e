use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{flux::FluxVariant, GeneratorOptions, ModelLike};

pub trait Loader {
    type Model: ModelLike;

    fn load(
        variant: FluxVariant,
        api: Api,
        options: GeneratorOptions,
    ) -> impl Future<Output = Result<Self::Model>> + Send
    where
        Self: Sized;
}
