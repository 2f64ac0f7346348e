//! Linear layers with a selectable GEMM precision.

use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GemmPrecision {
    #[default]
    Full,
    /// Weights stored as Q8_0 blocks, activations multiplied in f32.
    Q8,
}

#[derive(Debug, Clone)]
pub enum Linear {
    Dense(candle_nn::Linear),
    Quantized { weight: QMatMul, bias: Option<Tensor> },
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>, precision: GemmPrecision) -> Result<Self> {
        match precision {
            GemmPrecision::Full => Ok(Self::Dense(candle_nn::Linear::new(weight, bias))),
            GemmPrecision::Q8 => {
                let qtensor = QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
                Ok(Self::Quantized {
                    weight: QMatMul::from_qtensor(qtensor)?,
                    bias: bias.map(|b| b.to_dtype(DType::F32)).transpose()?,
                })
            }
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized { .. })
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(linear) => linear.forward(xs),
            Self::Quantized { weight, bias } => {
                let dtype = xs.dtype();
                let ys = weight.forward(&xs.to_dtype(DType::F32)?)?;
                let ys = match bias {
                    Some(bias) => ys.broadcast_add(bias)?,
                    None => ys,
                };
                ys.to_dtype(dtype)
            }
        }
    }
}

pub fn linear_b(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    precision: GemmPrecision,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
    let bias = if bias {
        let bound = 1. / (in_dim as f64).sqrt();
        let init = candle_nn::Init::Uniform {
            lo: -bound,
            up: bound,
        };
        Some(vb.get_with_hints(out_dim, "bias", init)?)
    } else {
        None
    };
    Linear::new(weight, bias, precision)
}

pub fn linear(in_dim: usize, out_dim: usize, precision: GemmPrecision, vb: VarBuilder) -> Result<Linear> {
    linear_b(in_dim, out_dim, true, precision, vb)
}
