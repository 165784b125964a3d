//! Learnable bypass gate with per-sequence layer skipping.
//!
//! Blends a block's output with its input through a per-channel scale in
//! [0, 1]. During training the scale is clamped into a scheduled range that
//! starts near straight-through (forcing new modules to learn something)
//! and relaxes over the warmup horizon; whole sequences are randomly
//! snapped to the input (layer skip) at the configured rate. At inference
//! the raw learned scale is used and the gate is deterministic.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use super::schedule::{ScheduledFloat, TrainingContext};
use crate::Result;

#[derive(Debug, Clone)]
pub struct BypassModule {
    bypass_scale: Tensor,
    skip_rate: ScheduledFloat,
    straight_through_rate: ScheduledFloat,
    scale_min: ScheduledFloat,
    scale_max: f64,
}

impl BypassModule {
    pub fn new(
        embed_dim: usize,
        skip_rate: ScheduledFloat,
        straight_through_rate: ScheduledFloat,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bypass_scale = vb.get_with_hints((embed_dim,), "bypass_scale", Init::Const(0.5))?;
        Ok(Self {
            bypass_scale,
            skip_rate,
            straight_through_rate,
            scale_min: ScheduledFloat::new(&[(0.0, 0.9), (20000.0, 0.2)]),
            scale_max: 1.0,
        })
    }

    /// A gate with no layer skipping and no straight-through override.
    pub fn without_skip(embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        Self::new(
            embed_dim,
            ScheduledFloat::constant(0.0),
            ScheduledFloat::constant(0.0),
            vb,
        )
    }

    /// The effective scale on the non-residual term: `(embed_dim,)` at
    /// inference, `(batch, embed_dim)` when per-sequence randomness applies.
    fn bypass_scale(
        &self,
        batch_size: usize,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let ctx = match train {
            None => return Ok(self.bypass_scale.clone()),
            Some(ctx) => ctx,
        };
        let lo = self.scale_min.value_at(ctx.batch());
        let mut ans = self.bypass_scale.clamp(lo, self.scale_max)?;

        let skip_rate = self.skip_rate.value_at(ctx.batch());
        if let Some(mask) = ctx.keep_mask(batch_size, skip_rate, ans.device())? {
            // Zero scale = the whole sequence bypasses this module.
            ans = mask.broadcast_mul(&ans)?;
        }

        let st_rate = self.straight_through_rate.value_at(ctx.batch());
        if st_rate > 0.0 {
            let mask = ctx.bernoulli_mask(batch_size, st_rate, ans.device())?;
            ans = ans.broadcast_maximum(&mask)?;
        }
        Ok(ans)
    }

    /// `src_orig + (src - src_orig) * scale`; both inputs
    /// `(seq_len, batch, embed_dim)`.
    pub fn forward(
        &self,
        src_orig: &Tensor,
        src: &Tensor,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let batch_size = src.dim(1)?;
        let scale = self.bypass_scale(batch_size, train)?;
        let delta = (src - src_orig)?;
        Ok(src_orig.broadcast_add(&delta.broadcast_mul(&scale)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_gate(dev: &Device, dim: usize) -> BypassModule {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        BypassModule::without_skip(dim, vb.pp("bypass")).unwrap()
    }

    #[test]
    fn initial_scale_is_midpoint() {
        let dev = Device::Cpu;
        let gate = make_gate(&dev, 8);
        let src_orig = Tensor::zeros((3, 2, 8), DType::F32, &dev).unwrap();
        let src = Tensor::ones((3, 2, 8), DType::F32, &dev).unwrap();
        let out: Vec<f32> = gate
            .forward(&src_orig, &src, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for v in out {
            assert!((v - 0.5).abs() < 1e-6, "expected midpoint blend, got {v}");
        }
    }

    #[test]
    fn inference_ignores_skip_rate() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gate = BypassModule::new(
            4,
            ScheduledFloat::constant(1.0), // would always skip in training
            ScheduledFloat::constant(0.0),
            vb.pp("bypass"),
        )
        .unwrap();
        let src_orig = Tensor::zeros((2, 3, 4), DType::F32, &dev).unwrap();
        let src = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let out: Vec<f32> = gate
            .forward(&src_orig, &src, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for v in out {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn training_skip_rate_one_bypasses_everything() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gate = BypassModule::new(
            4,
            ScheduledFloat::constant(1.0),
            ScheduledFloat::constant(0.0),
            vb.pp("bypass"),
        )
        .unwrap();
        let ctx = TrainingContext::new(0.0, 3);
        let src_orig = Tensor::zeros((2, 3, 4), DType::F32, &dev).unwrap();
        let src = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let out: Vec<f32> = gate
            .forward(&src_orig, &src, Some(&ctx))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // keep probability is 1 - rate = 0, so every sequence is skipped.
        for v in out {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn straight_through_rate_one_copies_src() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gate = BypassModule::new(
            4,
            ScheduledFloat::constant(0.0),
            ScheduledFloat::constant(1.0),
            vb.pp("bypass"),
        )
        .unwrap();
        let ctx = TrainingContext::new(0.0, 5);
        let src_orig = Tensor::zeros((2, 3, 4), DType::F32, &dev).unwrap();
        let src = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let out: Vec<f32> = gate
            .forward(&src_orig, &src, Some(&ctx))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for v in out {
            assert_eq!(v, 1.0);
        }
    }
}
