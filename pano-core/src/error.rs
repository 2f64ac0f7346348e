use thiserror::Error;

/// Validation failures raised before any tensor work starts.
///
/// Framework failures (hub downloads, device allocation, kernels) are not
/// wrapped here; they travel as `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum PanoramaError {
    #[error("invalid device `{0}`, expected `cpu`, an ordinal or `cuda:<n>`")]
    InvalidDevice(String),

    #[error("image size {width}x{height} must be a positive multiple of 16")]
    InvalidDimensions { width: usize, height: usize },

    #[error("blend extent {blend} exceeds the latent width {width}")]
    BlendTooWide { blend: usize, width: usize },

    #[error("num_inference_steps must be at least 1")]
    NoSteps,

    #[error("decode tile size {tile_size} must exceed its overlap {overlap}")]
    InvalidTiling { tile_size: usize, overlap: usize },

    #[error("the block cache cannot be combined with a canvas shift of {0} columns")]
    CacheWithShift(usize),

    #[error("invalid offload policy `{0}`, expected `sequential` or `resident`")]
    InvalidOffload(String),

    #[error("unsupported model `{0}`")]
    UnsupportedModel(String),

    #[error("adapter `{0}` does not match any transformer parameter")]
    AdapterMismatch(String),
}
