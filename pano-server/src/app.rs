use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::ValueEnum;
use hf_hub::api::tokio::Api;
use pano_core::{image_to_png, load_model, GenerationRequest, GeneratorOptions, ModelLike};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Produces ready-to-run generators.
pub trait GeneratorSource: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = Result<Box<dyn ModelLike>>> + Send;
}

/// Downloads weights from the Hugging Face hub and builds the pipeline.
pub struct HubSource {
    options: GeneratorOptions,
}

impl HubSource {
    pub fn new(options: GeneratorOptions) -> Self {
        Self { options }
    }
}

impl GeneratorSource for HubSource {
    fn load(&self) -> impl Future<Output = Result<Box<dyn ModelLike>>> + Send {
        let options = self.options.clone();
        async move {
            let api = Api::new().context("failed to create hub client")?;
            load_model(api, options).await
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LoadPolicy {
    /// Load a fresh generator for every request and drop it afterwards.
    #[default]
    PerRequest,
    /// Keep one generator loaded; requests take turns using it.
    Shared,
}

pub struct AppState<S> {
    source: S,
    policy: LoadPolicy,
    seed: u64,
    shared: Mutex<Option<Box<dyn ModelLike>>>,
}

impl<S: GeneratorSource> AppState<S> {
    pub fn new(source: S, policy: LoadPolicy, seed: u64) -> Self {
        Self {
            source,
            policy,
            seed,
            shared: Mutex::new(None),
        }
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Vec<u8>> {
        match self.policy {
            LoadPolicy::PerRequest => {
                let model = self.source.load().await?;
                let (_, png) = run_blocking(model, request).await?;
                png
            }
            LoadPolicy::Shared => {
                let mut slot = self.shared.lock().await;
                let model = match slot.take() {
                    Some(model) => model,
                    None => {
                        info!("loading shared generator");
                        self.source.load().await?
                    }
                };
                // A panic inside the task loses the generator; the slot stays
                // empty and the next request reloads it.
                let (model, png) = run_blocking(model, request).await?;
                *slot = Some(model);
                png
            }
        }
    }
}

/// Runs inference and PNG encoding off the async runtime, handing the
/// generator back alongside the outcome.
async fn run_blocking(
    mut model: Box<dyn ModelLike>,
    request: GenerationRequest,
) -> Result<(Box<dyn ModelLike>, Result<Vec<u8>>)> {
    tokio::task::spawn_blocking(move || {
        let png = model.run(&request).and_then(|img| image_to_png(&img));
        (model, png)
    })
    .await
    .context("generation task panicked")
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = ?self.0, "panorama generation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "panorama generation failed" })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Deserialize)]
pub struct PanoramaQuery {
    prompt: String,
    #[serde(default)]
    negative_prompt: String,
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "API is running" }))
}

async fn generate_panorama<S: GeneratorSource>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<PanoramaQuery>,
) -> Result<Response, AppError> {
    let request = GenerationRequest::new(query.prompt)
        .with_negative_prompt(query.negative_prompt)
        .with_seed(state.seed);
    let png = state.generate(request).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

pub fn router<S: GeneratorSource>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/generate-panorama", get(generate_panorama::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct FakeGenerator {
        width: u32,
        height: u32,
    }

    impl ModelLike for FakeGenerator {
        fn run(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
            let tint = (request.seed as usize + request.prompt.len()) as u8;
            let buffer = ImageBuffer::from_fn(self.width, self.height, |x, y| {
                Rgb([(x % 256) as u8, (y % 256) as u8, tint])
            });
            Ok(DynamicImage::ImageRgb8(buffer))
        }
    }

    #[derive(Clone, Default)]
    struct FakeSource {
        loads: Arc<AtomicUsize>,
        fail: bool,
        size: Option<(u32, u32)>,
    }

    impl GeneratorSource for FakeSource {
        fn load(&self) -> impl Future<Output = Result<Box<dyn ModelLike>>> + Send {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            let (width, height) = self.size.unwrap_or((64, 32));
            async move {
                if fail {
                    anyhow::bail!("weights unavailable");
                }
                Ok(Box::new(FakeGenerator { width, height }) as Box<dyn ModelLike>)
            }
        }
    }

    fn app(source: FakeSource, policy: LoadPolicy) -> Router {
        router(Arc::new(AppState::new(source, policy, 42)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, content_type, body)
    }

    #[tokio::test]
    async fn root_reports_status() {
        let source = FakeSource::default();
        let (status, _, body) = get(app(source.clone(), LoadPolicy::PerRequest), "/").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "status": "API is running" }));
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generates_a_png_panorama() {
        let source = FakeSource {
            size: Some((1920, 960)),
            ..Default::default()
        };
        let (status, content_type, body) = get(
            app(source, LoadPolicy::PerRequest),
            "/generate-panorama?prompt=a%20snowy%20mountain%20valley&negative_prompt=blurry",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/png"));
        let img = image::load_from_memory_with_format(&body, image::ImageFormat::Png).unwrap();
        assert_eq!((img.width(), img.height()), (1920, 960));
    }

    #[tokio::test]
    async fn empty_prompt_is_accepted() {
        let (status, _, body) =
            get(app(FakeSource::default(), LoadPolicy::PerRequest), "/generate-panorama?prompt=").await;
        assert_eq!(status, StatusCode::OK);
        assert!(image::load_from_memory(&body).is_ok());
    }

    #[tokio::test]
    async fn missing_prompt_is_a_client_error() {
        let source = FakeSource::default();
        let (status, _, _) = get(app(source.clone(), LoadPolicy::PerRequest), "/generate-panorama").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_failures_become_server_errors() {
        let source = FakeSource {
            fail: true,
            ..Default::default()
        };
        let (status, _, body) = get(app(source, LoadPolicy::Shared), "/generate-panorama?prompt=x").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["detail"], "panorama generation failed");
    }

    #[tokio::test]
    async fn identical_requests_give_identical_bytes() {
        let uri = "/generate-panorama?prompt=a%20beach";
        let source = FakeSource::default();
        let (_, _, first) = get(app(source.clone(), LoadPolicy::PerRequest), uri).await;
        let (_, _, second) = get(app(source.clone(), LoadPolicy::PerRequest), uri).await;
        assert_eq!(first, second);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shared_policy_loads_once() {
        let source = FakeSource::default();
        let app = app(source.clone(), LoadPolicy::Shared);
        for prompt in ["a", "b", "c"] {
            let (status, _, _) = get(app.clone(), &format!("/generate-panorama?prompt={prompt}")).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }
}
