//! Feed-forward module of the encoder layer.
//!
//! `Linear → SwooshL → dropout → Linear`, with the output projection
//! initialized small so a fresh layer barely perturbs its residual stream.
//! The dropout mask is shared along the time axis and its rate decays over
//! training.

use candle_core::Tensor;
use candle_nn::{self as nn, VarBuilder};

use super::ops::{scaled_linear, swoosh_l};
use super::schedule::{ScheduledFloat, TrainingContext};
use crate::Result;

#[derive(Debug, Clone)]
pub struct FeedforwardModule {
    in_proj: nn::Linear,
    out_proj: nn::Linear,
    dropout: ScheduledFloat,
}

impl FeedforwardModule {
    pub fn new(embed_dim: usize, feedforward_dim: usize, vb: VarBuilder) -> Result<Self> {
        let in_proj = nn::linear(embed_dim, feedforward_dim, vb.pp("in_proj"))?;
        let out_proj = scaled_linear(feedforward_dim, embed_dim, 0.1, vb.pp("out_proj"))?;
        Ok(Self {
            in_proj,
            out_proj,
            dropout: ScheduledFloat::new(&[(0.0, 0.3), (20000.0, 0.1)]),
        })
    }

    /// `x`: `(seq_len, batch, embed_dim)` → same shape.
    pub fn forward(&self, x: &Tensor, train: Option<&TrainingContext>) -> Result<Tensor> {
        let x = x.apply(&self.in_proj)?;
        let mut x = swoosh_l(&x)?;
        if let Some(ctx) = train {
            x = ctx.dropout_time_shared(&x, self.dropout.value_at(ctx.batch()))?;
        }
        Ok(x.apply(&self.out_proj)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn output_shape_matches_input() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ff = FeedforwardModule::new(32, 96, vb.pp("ff")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (9, 3, 32), &dev).unwrap();
        let y = ff.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[9, 3, 32]);
    }

    #[test]
    fn inference_has_no_dropout() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ff = FeedforwardModule::new(16, 48, vb.pp("ff")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 2, 16), &dev).unwrap();
        let a: Vec<f32> = ff
            .forward(&x, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = ff
            .forward(&x, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }
}
