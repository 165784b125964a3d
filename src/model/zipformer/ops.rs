//! Shared tensor helpers: Swoosh activations, bias-subtracting norm,
//! small-scale linear init, boolean-mask filling, strided subsampling.

use candle_core::{Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

use crate::Result;

/// Numerically stable `ln(1 + exp(x))`.
fn softplus(x: &Tensor) -> Result<Tensor> {
    // max(x, 0) + ln(1 + exp(-|x|))
    let relu = x.relu()?;
    let tail = ((x.abs()?.neg()?).exp()? + 1.0)?.log()?;
    Ok((relu + tail)?)
}

/// SwooshL activation: `ln(1 + exp(x - 4)) - 0.08x - 0.035`.
///
/// Roughly ReLU-shaped with a left-side slope of -0.08; used after the
/// feed-forward expansion.
pub(crate) fn swoosh_l(x: &Tensor) -> Result<Tensor> {
    let sp = softplus(&(x - 4.0)?)?;
    Ok(((sp - (x * 0.08)?)? - 0.035)?)
}

/// SwooshR activation: `ln(1 + exp(x - 1)) - 0.08x - 0.313261687`.
///
/// Crosses zero at the origin; used in the convolution module and the
/// time-embedding projections.
pub(crate) fn swoosh_r(x: &Tensor) -> Result<Tensor> {
    let sp = softplus(&(x - 1.0)?)?;
    Ok(((sp - (x * 0.08)?)? - 0.313_261_687)?)
}

/// Linear layer whose weight is initialized `initial_scale` times smaller
/// than the usual `1/sqrt(fan_in)`, so the module starts out contributing
/// little to its residual stream. When loading stored weights the init is
/// ignored.
pub(crate) fn scaled_linear(
    in_dim: usize,
    out_dim: usize,
    initial_scale: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let stdev = initial_scale / (in_dim as f64).sqrt();
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Randn { mean: 0.0, stdev })?;
    let bias = vb.get_with_hints((out_dim,), "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Same as [`scaled_linear`] but without a bias term.
pub(crate) fn scaled_linear_no_bias(
    in_dim: usize,
    out_dim: usize,
    initial_scale: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let stdev = initial_scale / (in_dim as f64).sqrt();
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Randn { mean: 0.0, stdev })?;
    Ok(Linear::new(weight, None))
}

/// Set `xs` to `value` wherever the boolean (U8) `mask` is nonzero.
/// The mask is broadcast to the shape of `xs`.
pub(crate) fn masked_fill(xs: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let mask = mask.broadcast_as(xs.dims())?;
    let on_true = Tensor::full(value, xs.dims(), xs.device())?.to_dtype(xs.dtype())?;
    Ok(mask.where_cond(&on_true, xs)?)
}

/// Take every `stride`-th index along `dim` (`t[.., ::stride, ..]`).
pub(crate) fn stride_select(t: &Tensor, dim: usize, stride: usize) -> Result<Tensor> {
    if stride <= 1 {
        return Ok(t.clone());
    }
    let len = t.dim(dim)?;
    let idx: Vec<u32> = (0..len).step_by(stride).map(|i| i as u32).collect();
    let n = idx.len();
    let idx = Tensor::from_vec(idx, (n,), t.device())?;
    Ok(t.index_select(&idx, dim)?)
}

/// Layer norm variant that subtracts a learned per-channel bias before
/// computing the RMS, then rescales by a learned scalar — no mean removal
/// and no per-channel gain.
#[derive(Debug, Clone)]
pub struct BiasNorm {
    bias: Tensor,
    log_scale: Tensor,
}

impl BiasNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let bias = vb.get_with_hints((dim,), "bias", Init::Const(0.0))?;
        let log_scale = vb.get_with_hints((1,), "log_scale", Init::Const(0.0))?;
        Ok(Self { bias, log_scale })
    }

    /// `x * exp(log_scale) / rms(x - bias)`, RMS over the channel axis.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let centered = x.broadcast_sub(&self.bias)?;
        let rms_inv = centered.sqr()?.mean_keepdim(D::Minus1)?.powf(-0.5)?;
        let scales = rms_inv.broadcast_mul(&self.log_scale.exp()?)?;
        Ok(x.broadcast_mul(&scales)?)
    }
}
