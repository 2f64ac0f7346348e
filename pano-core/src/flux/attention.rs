//! Attention execution strategies for the transformer blocks.
//!
//! Every backend receives rotary-embedded `(batch, heads, seq, head_dim)`
//! tensors and returns the attended values in the same layout.

use candle_core::{DType, Result, Tensor, D};
use std::{fmt::Debug, sync::Arc};

pub trait AttentionBackend: Debug + Send + Sync {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor>;

    fn name(&self) -> &'static str;
}

/// Picks the backend for the requested precision.
pub fn attention_backend(low_precision: bool) -> Arc<dyn AttentionBackend> {
    if low_precision {
        return Arc::new(QuantizedAttention);
    }
    #[cfg(feature = "flash-attn")]
    {
        Arc::new(FlashAttention)
    }
    #[cfg(not(feature = "flash-attn"))]
    {
        Arc::new(StandardAttention)
    }
}

fn scaled_dot_product(q: &Tensor, k: &Tensor, v: &Tensor, scores_dtype: DType) -> Result<Tensor> {
    let (b, h, seq, dim) = q.dims4()?;
    let scale_factor = 1.0 / (dim as f64).sqrt();
    let q = q.flatten_to(1)?.to_dtype(scores_dtype)?;
    let k = k.flatten_to(1)?.to_dtype(scores_dtype)?;
    let v = v.flatten_to(1)?;
    let attn_weights = (q.matmul(&k.t()?)? * scale_factor)?;
    let attn_probs = candle_nn::ops::softmax_last_dim(&attn_weights)?.to_dtype(v.dtype())?;
    attn_probs.matmul(&v)?.reshape((b, h, seq, dim))
}

/// Full-precision softmax attention in the working dtype.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardAttention;

impl AttentionBackend for StandardAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        scaled_dot_product(q, k, v, q.dtype())
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// 8-bit Q/K attention.
///
/// Keys are smoothed by removing their mean over tokens (softmax is
/// invariant to it), then Q and K are quantized per token to a symmetric
/// int8 grid. Scores and softmax run in f32, P·V in the working dtype.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizedAttention;

/// Symmetric int8 round trip with one scale per row of the last dim.
pub(crate) fn fake_quantize_rows(xs: &Tensor) -> Result<Tensor> {
    let xs = xs.to_dtype(DType::F32)?;
    let amax = xs.abs()?.max_keepdim(D::Minus1)?.clamp(1e-8f32, f32::MAX)?;
    let scale = (amax / 127.0)?;
    xs.broadcast_div(&scale)?
        .round()?
        .clamp(-127f32, 127f32)?
        .broadcast_mul(&scale)
}

impl AttentionBackend for QuantizedAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let dtype = q.dtype();
        let k = k.to_dtype(DType::F32)?;
        let k = k.broadcast_sub(&k.mean_keepdim(D::Minus2)?)?;
        let q = fake_quantize_rows(q)?;
        let k = fake_quantize_rows(&k)?;
        scaled_dot_product(&q, &k, &v.to_dtype(dtype)?, DType::F32)
    }

    fn name(&self) -> &'static str {
        "int8-qk"
    }
}

#[cfg(feature = "flash-attn")]
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashAttention;

#[cfg(feature = "flash-attn")]
impl AttentionBackend for FlashAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let softmax_scale = 1f32 / (q.dim(D::Minus1)? as f32).sqrt();
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        candle_flash_attn::flash_attn(&q, &k, &v, softmax_scale, false)?.transpose(1, 2)
    }

    fn name(&self) -> &'static str {
        "flash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn qkv() -> (Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (1, 2, 16, 32), &dev).unwrap();
        let k = Tensor::randn(0f32, 1., (1, 2, 16, 32), &dev).unwrap();
        let v = Tensor::randn(0f32, 1., (1, 2, 16, 32), &dev).unwrap();
        (q, k, v)
    }

    #[test]
    fn standard_is_invariant_to_key_offsets() {
        let (q, k, v) = qkv();
        let offset = Tensor::randn(0f32, 3., (1, 2, 1, 32), &Device::Cpu).unwrap();
        let shifted = k.broadcast_add(&offset).unwrap();
        let a = StandardAttention.attend(&q, &k, &v).unwrap();
        let b = StandardAttention.attend(&q, &shifted, &v).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-4);
    }

    #[test]
    fn quantized_tracks_standard() {
        let (q, k, v) = qkv();
        let reference = StandardAttention.attend(&q, &k, &v).unwrap();
        let quantized = QuantizedAttention.attend(&q, &k, &v).unwrap();
        assert_eq!(quantized.dims(), reference.dims());
        assert_eq!(quantized.dtype(), DType::F32);
        assert!(max_abs_diff(&reference, &quantized) < 0.1);
    }

    #[test]
    fn fake_quantization_uses_255_levels() {
        let xs = Tensor::new(&[[0.0f32, 0.3, -1.0, 0.003]], &Device::Cpu).unwrap();
        let q = fake_quantize_rows(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert!((q[0][2] + 1.0).abs() < 1e-5);
        assert!((q[0][1] - 38.0 / 127.0).abs() < 1e-5);
        assert_eq!(q[0][3], 0.0);
    }

    #[test]
    fn low_precision_selects_quantized_backend() {
        assert_eq!(attention_backend(true).name(), "int8-qk");
    }
}
