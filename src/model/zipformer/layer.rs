//! The Zipformer encoder layer.
//!
//! One layer applies, in order: feed-forward (3/4 width), nonlinear
//! attention, self-attention, convolution, feed-forward (full width), a
//! mid-layer bypass, a second self-attention pass, a second convolution,
//! feed-forward (5/4 width), a bias-subtracting norm, and the primary
//! bypass gate against the layer input. The attention weights are computed
//! once and shared by both self-attention passes and the nonlinear
//! attention.
//!
//! Every stochastic regularizer (per-sequence skips, constant-attention
//! substitution, dropout) draws from the [`TrainingContext`] and vanishes
//! when it is absent.

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use super::attention::{NonlinAttention, RelPositionMultiheadAttentionWeights, SelfAttention};
use super::bypass::BypassModule;
use super::convolution::ConvolutionModule;
use super::feedforward::FeedforwardModule;
use super::ops::BiasNorm;
use super::schedule::{ScheduledFloat, TrainingContext};
use crate::{Result, ZipformerConfig};

#[derive(Debug, Clone)]
pub struct ZipformerEncoderLayer {
    self_attn_weights: RelPositionMultiheadAttentionWeights,
    self_attn1: SelfAttention,
    self_attn2: SelfAttention,
    feed_forward1: FeedforwardModule,
    feed_forward2: FeedforwardModule,
    feed_forward3: FeedforwardModule,
    nonlin_attention: NonlinAttention,
    conv_module1: Option<ConvolutionModule>,
    conv_module2: Option<ConvolutionModule>,
    norm: BiasNorm,
    /// Primary gate against the layer input; its skip rate carries the
    /// per-layer warmup schedule set by the owning encoder stack.
    bypass: BypassModule,
    bypass_mid: BypassModule,
    attention_skip_rate: ScheduledFloat,
    conv_skip_rate: ScheduledFloat,
    const_attention_rate: ScheduledFloat,
    ff2_skip_rate: ScheduledFloat,
    ff3_skip_rate: ScheduledFloat,
}

impl ZipformerEncoderLayer {
    pub fn new(
        cfg: &ZipformerConfig,
        cnn_module_kernel: usize,
        bypass_skip_rate: ScheduledFloat,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d = cfg.encoder_dim;
        let ff = cfg.feedforward_dim;

        let self_attn_weights = RelPositionMultiheadAttentionWeights::new(
            d,
            cfg.pos_dim,
            cfg.num_heads,
            cfg.query_head_dim,
            cfg.pos_head_dim,
            0.0,
            vb.pp("self_attn_weights"),
        )?;
        let self_attn1 = SelfAttention::new(d, cfg.num_heads, cfg.value_head_dim, vb.pp("self_attn1"))?;
        let self_attn2 = SelfAttention::new(d, cfg.num_heads, cfg.value_head_dim, vb.pp("self_attn2"))?;

        let feed_forward1 = FeedforwardModule::new(d, (ff * 3) / 4, vb.pp("feed_forward1"))?;
        let feed_forward2 = FeedforwardModule::new(d, ff, vb.pp("feed_forward2"))?;
        let feed_forward3 = FeedforwardModule::new(d, (ff * 5) / 4, vb.pp("feed_forward3"))?;

        let nonlin_attention = NonlinAttention::new(d, 3 * d / 4, vb.pp("nonlin_attention"))?;

        let (conv_module1, conv_module2) = if cfg.use_conv {
            (
                Some(ConvolutionModule::new(d, cnn_module_kernel, vb.pp("conv_module1"))?),
                Some(ConvolutionModule::new(d, cnn_module_kernel, vb.pp("conv_module2"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            self_attn_weights,
            self_attn1,
            self_attn2,
            feed_forward1,
            feed_forward2,
            feed_forward3,
            nonlin_attention,
            conv_module1,
            conv_module2,
            norm: BiasNorm::new(d, vb.pp("norm"))?,
            bypass: BypassModule::new(
                d,
                bypass_skip_rate,
                ScheduledFloat::constant(0.0),
                vb.pp("bypass"),
            )?,
            bypass_mid: BypassModule::without_skip(d, vb.pp("bypass_mid"))?,
            attention_skip_rate: ScheduledFloat::new(&[(0.0, 0.2), (4000.0, 0.05), (16000.0, 0.0)]),
            conv_skip_rate: ScheduledFloat::new(&[(0.0, 0.2), (4000.0, 0.05), (16000.0, 0.0)]),
            const_attention_rate: ScheduledFloat::new(&[(0.0, 0.25), (4000.0, 0.025)]),
            ff2_skip_rate: ScheduledFloat::new(&[(0.0, 0.1), (4000.0, 0.01), (50000.0, 0.0)]),
            ff3_skip_rate: ScheduledFloat::new(&[(0.0, 0.1), (4000.0, 0.01), (50000.0, 0.0)]),
        })
    }

    /// Zero a sub-block's contribution for randomly chosen sequences.
    fn sequence_dropout(
        &self,
        x: &Tensor,
        rate: f64,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let ctx = match train {
            Some(ctx) => ctx,
            None => return Ok(x.clone()),
        };
        match ctx.keep_mask(x.dim(1)?, rate, x.device())? {
            // (batch, 1) -> broadcast over (seq, batch, channels)
            Some(mask) => Ok(x.broadcast_mul(&mask)?),
            None => Ok(x.clone()),
        }
    }

    /// Replace attention weights by a uniform distribution over the
    /// positions that received nonzero weight, pushing the consumer toward
    /// an averaging-over-time operation.
    fn uniformize(weights: &Tensor) -> Result<Tensor> {
        let nonzero = weights.gt(0.0)?.to_dtype(weights.dtype())?;
        let counts = nonzero.sum_keepdim(D::Minus1)?;
        Ok(nonzero.broadcast_div(&counts)?)
    }

    /// Pass the input through the encoder layer.
    ///
    /// - `src`: `(seq_len, batch, embed_dim)`
    /// - `pos_emb`: `(1, 2*seq_len - 1, pos_dim)`
    /// - `time_emb`: `(batch, embed_dim)` or `(seq_len, batch, embed_dim)`
    /// - `attn_mask`: U8 `(seq_len, seq_len)` or `(batch, seq_len, seq_len)`
    /// - `src_key_padding_mask`: U8 `(batch, seq_len)`
    pub fn forward(
        &self,
        src: &Tensor,
        pos_emb: &Tensor,
        time_emb: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        src_key_padding_mask: Option<&Tensor>,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let src_orig = src.clone();
        let batch = src.dim(1)?;

        // Shared by both self-attention passes and the nonlinear attention.
        let attn_weights =
            self.self_attn_weights
                .forward(src, pos_emb, src_key_padding_mask, attn_mask, train)?;

        let mut src = src.clone();
        if let Some(te) = time_emb {
            src = src.broadcast_add(te)?;
        }

        src = (&src + self.feed_forward1.forward(&src, train)?)?;

        // One keep-mask shared by the three attention consumers: a skipped
        // sequence suppresses all of them together.
        let attention_skip_rate = self.attention_skip_rate.rate(train);
        let self_attn_keep = match train {
            Some(ctx) => ctx.keep_mask(batch, attention_skip_rate, src.device())?,
            None => None,
        };
        let gated = |x: Tensor| -> Result<Tensor> {
            match &self_attn_keep {
                Some(mask) => Ok(x.broadcast_mul(mask)?),
                None => Ok(x),
            }
        };

        // The nonlinear attention consumes only the first head, optionally
        // substituted by a masked uniform average; the self-attention
        // passes always see the real weights.
        let mut selected_attn_weights = attn_weights.narrow(0, 0, 1)?;
        if let Some(ctx) = train {
            if ctx.coin(self.const_attention_rate.value_at(ctx.batch())) {
                selected_attn_weights = Self::uniformize(&selected_attn_weights)?;
            }
        }

        let na = self.nonlin_attention.forward(&src, &selected_attn_weights)?;
        src = (&src + gated(na)?)?;

        let self_attn = self.self_attn1.forward(&src, &attn_weights)?;
        src = (&src + gated(self_attn)?)?;

        if let Some(conv) = &self.conv_module1 {
            if let Some(te) = time_emb {
                src = src.broadcast_add(te)?;
            }
            let c = conv.forward(&src, src_key_padding_mask)?;
            src = (&src + self.sequence_dropout(&c, self.conv_skip_rate.rate(train), train)?)?;
        }

        let ff2 = self.feed_forward2.forward(&src, train)?;
        src = (&src + self.sequence_dropout(&ff2, self.ff2_skip_rate.rate(train), train)?)?;

        src = self.bypass_mid.forward(&src_orig, &src, train)?;

        let self_attn = self.self_attn2.forward(&src, &attn_weights)?;
        src = (&src + gated(self_attn)?)?;

        if let Some(conv) = &self.conv_module2 {
            if let Some(te) = time_emb {
                src = src.broadcast_add(te)?;
            }
            let c = conv.forward(&src, src_key_padding_mask)?;
            src = (&src + self.sequence_dropout(&c, self.conv_skip_rate.rate(train), train)?)?;
        }

        let ff3 = self.feed_forward3.forward(&src, train)?;
        src = (&src + self.sequence_dropout(&ff3, self.ff3_skip_rate.rate(train), train)?)?;

        src = self.norm.forward(&src)?;

        self.bypass.forward(&src_orig, &src, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_cfg() -> ZipformerConfig {
        ZipformerConfig {
            encoder_dim: 64,
            num_heads: 4,
            query_head_dim: 8,
            pos_head_dim: 4,
            value_head_dim: 8,
            feedforward_dim: 96,
            pos_dim: 48,
            ..Default::default()
        }
    }

    fn make_layer(dev: &Device, cfg: &ZipformerConfig) -> ZipformerEncoderLayer {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        ZipformerEncoderLayer::new(cfg, 7, ScheduledFloat::constant(0.0), vb.pp("layer")).unwrap()
    }

    fn pos_emb(dev: &Device, seq_len: usize, pos_dim: usize) -> Tensor {
        let pos =
            super::super::pos_embed::CompactRelPositionalEncoding::new(pos_dim, 0.0, 1.0).unwrap();
        pos.forward(seq_len, DType::F32, dev, None).unwrap()
    }

    #[test]
    fn output_shape_matches_input() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let layer = make_layer(&dev, &cfg);
        let x = Tensor::randn(0f32, 1.0, (9, 2, 64), &dev).unwrap();
        let pe = pos_emb(&dev, 9, 48);
        let y = layer.forward(&x, &pe, None, None, None, None).unwrap();
        assert_eq!(y.dims(), &[9, 2, 64]);
    }

    #[test]
    fn accepts_per_batch_and_per_frame_time_embedding() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let layer = make_layer(&dev, &cfg);
        let x = Tensor::randn(0f32, 1.0, (6, 2, 64), &dev).unwrap();
        let pe = pos_emb(&dev, 6, 48);

        let te_batch = Tensor::randn(0f32, 1.0, (2, 64), &dev).unwrap();
        let y = layer
            .forward(&x, &pe, Some(&te_batch), None, None, None)
            .unwrap();
        assert_eq!(y.dims(), &[6, 2, 64]);

        let te_frame = Tensor::randn(0f32, 1.0, (6, 2, 64), &dev).unwrap();
        let y = layer
            .forward(&x, &pe, Some(&te_frame), None, None, None)
            .unwrap();
        assert_eq!(y.dims(), &[6, 2, 64]);
    }

    #[test]
    fn inference_is_bit_reproducible() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let layer = make_layer(&dev, &cfg);
        let x = Tensor::randn(0f32, 1.0, (5, 2, 64), &dev).unwrap();
        let pe = pos_emb(&dev, 5, 48);
        let te = Tensor::randn(0f32, 1.0, (2, 64), &dev).unwrap();
        let a: Vec<f32> = layer
            .forward(&x, &pe, Some(&te), None, None, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = layer
            .forward(&x, &pe, Some(&te), None, None, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn no_conv_variant_runs() {
        let dev = Device::Cpu;
        let cfg = ZipformerConfig {
            use_conv: false,
            ..small_cfg()
        };
        let layer = make_layer(&dev, &cfg);
        let x = Tensor::randn(0f32, 1.0, (4, 1, 64), &dev).unwrap();
        let pe = pos_emb(&dev, 4, 48);
        let y = layer.forward(&x, &pe, None, None, None, None).unwrap();
        assert_eq!(y.dims(), &[4, 1, 64]);
    }

    #[test]
    fn uniformize_averages_over_nonzero_support() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[[[0.5f32, 0.5, 0.0], [0.2, 0.3, 0.5], [0.0, 0.0, 1.0]]]], &dev)
            .unwrap();
        let u: Vec<f32> = ZipformerEncoderLayer::uniformize(&w)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let third = 1.0f32 / 3.0;
        let expected = [0.5, 0.5, 0.0, third, third, third, 0.0, 0.0, 1.0];
        for (a, b) in u.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{u:?}");
        }
    }

    #[test]
    fn training_forward_runs_with_stochastic_gates() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = ZipformerEncoderLayer::new(
            &cfg,
            7,
            ScheduledFloat::new(&[(0.0, 0.5), (100.0, 0.05)]),
            vb.pp("layer"),
        )
        .unwrap();
        let x = Tensor::randn(0f32, 1.0, (5, 3, 64), &dev).unwrap();
        let pe = pos_emb(&dev, 5, 48);
        let ctx = TrainingContext::new(0.0, 1234);
        let y = layer.forward(&x, &pe, None, None, None, Some(&ctx)).unwrap();
        assert_eq!(y.dims(), &[5, 3, 64]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));
    }
}
