//! Sinusoidal timestep embedding for flow-matching conditioning.
//!
//! Converts scalar timestep values (and optionally a classifier-free
//! guidance scale embedded the same way) to fixed sinusoidal features, which
//! the top-level model then passes through a small MLP before sharing the
//! result with every encoder stack.

use candle_core::{DType, Tensor, D};
use candle_nn::{self as nn, Module, VarBuilder};

use super::ops::swoosh_r;
use crate::Result;

/// Create sinusoidal timestep embeddings.
///
/// `t` of shape `(N)` → `(N, dim)`; `t` of shape `(N, T)` (a timestep per
/// frame) → `(T, N, dim)`, sequence-major like the encoder stream. An odd
/// `dim` is zero-padded by one column.
///
/// Pure function of its inputs: no parameters, no randomness, and the
/// embedding of each timestep is independent of its batch neighbors.
pub fn timestep_embedding(t: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let max_period: f64 = 10000.0;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::from_vec(freqs, (half,), t.device())?;

    let t = match t.rank() {
        1 => t.clone(),
        // (N, T) -> (T, N)
        2 => t.transpose(0, 1)?.contiguous()?,
        r => {
            return Err(candle_core::Error::Msg(format!(
                "timestep tensor must have rank 1 or 2, got rank {r}"
            ))
            .into())
        }
    };

    let args = t
        .to_dtype(DType::F32)?
        .unsqueeze(D::Minus1)?
        .broadcast_mul(&freqs)?;
    let embedding = Tensor::cat(&[&args.cos()?, &args.sin()?], D::Minus1)?;
    if dim % 2 == 1 {
        Ok(embedding.pad_with_zeros(D::Minus1, 0, 1)?)
    } else {
        Ok(embedding)
    }
}

/// The learned MLP applied to the sinusoidal time embedding at the top
/// level: `Linear(d, 2d) → SwooshR → Linear(2d, d)`.
#[derive(Debug, Clone)]
pub struct TimeEmbed {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimeEmbed {
    pub fn new(time_embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = nn::linear(time_embed_dim, time_embed_dim * 2, vb.pp("0"))?;
        let linear_2 = nn::linear(time_embed_dim * 2, time_embed_dim, vb.pp("2"))?;
        Ok(Self { linear_1, linear_2 })
    }

    pub fn forward(&self, t_emb: &Tensor) -> Result<Tensor> {
        let h = self.linear_1.forward(t_emb)?;
        let h = swoosh_r(&h)?;
        Ok(self.linear_2.forward(&h)?)
    }
}
