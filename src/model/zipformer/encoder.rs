//! Encoder stacks: a stack of layers at one time resolution, and the
//! adapter that evaluates a stack at a reduced frame rate.
//!
//! Each stack owns its positional-encoding generator and an optional
//! projection taking the shared time embedding into the residual-stream
//! dimension. Layers are built by an explicit factory loop so each has its
//! own parameters; layer `i`'s bypass skip-rate warms up over the `i`-th of
//! `num_layers` equal slices of the stack's warmup interval, so early
//! layers finish their warmup before later layers start.

use candle_core::Tensor;
use candle_nn::{self as nn, Init, VarBuilder};

use super::bypass::BypassModule;
use super::layer::ZipformerEncoderLayer;
use super::ops::{stride_select, swoosh_r};
use super::pos_embed::CompactRelPositionalEncoding;
use super::schedule::{ScheduledFloat, TrainingContext};
use crate::{Error, Result, ZipformerConfig};

const INITIAL_LAYERDROP_RATE: f64 = 0.5;
const POS_EMB_DROPOUT: f64 = 0.15;

/// A stack of encoder layers sharing one time resolution.
#[derive(Debug)]
pub struct ZipformerEncoder {
    encoder_pos: CompactRelPositionalEncoding,
    time_proj: Option<nn::Linear>,
    layers: Vec<ZipformerEncoderLayer>,
}

impl ZipformerEncoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &ZipformerConfig,
        num_layers: usize,
        cnn_module_kernel: usize,
        warmup_begin: f64,
        warmup_end: f64,
        final_layerdrop_rate: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let encoder_pos = CompactRelPositionalEncoding::new(cfg.pos_dim, POS_EMB_DROPOUT, 1.0)?;
        let time_proj = if cfg.use_time_embed {
            Some(nn::linear(
                cfg.time_embed_dim,
                cfg.encoder_dim,
                vb.pp("time_emb.1"),
            )?)
        } else {
            None
        };

        // Each layer warms up over its own slice of [warmup_begin, warmup_end].
        let delta = (warmup_end - warmup_begin) / num_layers as f64;
        let mut cur_begin = warmup_begin;
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let cur_end = cur_begin + delta;
            let skip_rate = ScheduledFloat::new(&[
                (cur_begin, INITIAL_LAYERDROP_RATE),
                (cur_end, final_layerdrop_rate),
            ]);
            layers.push(ZipformerEncoderLayer::new(
                cfg,
                cnn_module_kernel,
                skip_rate,
                vb.pp(format!("layers.{i}")),
            )?);
            cur_begin = cur_end;
        }
        Ok(Self {
            encoder_pos,
            time_proj,
            layers,
        })
    }

    /// Pass the input through each layer in turn.
    ///
    /// - `src`: `(seq_len, batch, embed_dim)`
    /// - `time_emb`: shared embedding `(batch, time_embed_dim)` or
    ///   `(seq_len, batch, time_embed_dim)`; required iff the stack was
    ///   built with time conditioning
    pub fn forward(
        &self,
        src: &Tensor,
        time_emb: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        src_key_padding_mask: Option<&Tensor>,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let seq_len = src.dim(0)?;
        let pos_emb = self
            .encoder_pos
            .forward(seq_len, src.dtype(), src.device(), train)?;

        let time_emb = match (&self.time_proj, time_emb) {
            (Some(proj), Some(te)) => Some(swoosh_r(te)?.apply(proj)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Config(
                    "encoder stack expects a time embedding but none was given".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Config(
                    "encoder stack was built without time conditioning".into(),
                ))
            }
        };

        let mut output = src.clone();
        for layer in &self.layers {
            output = layer.forward(
                &output,
                &pos_emb,
                time_emb.as_ref(),
                attn_mask,
                src_key_padding_mask,
                train,
            )?;
        }
        Ok(output)
    }
}

/// Downsampling by weighted sum over blocks of consecutive frames; the
/// block weights are a learned softmax shared across channels and time.
#[derive(Debug, Clone)]
pub struct SimpleDownsample {
    weights: Tensor,
    downsample: usize,
}

impl SimpleDownsample {
    pub fn new(downsample: usize, vb: VarBuilder) -> Result<Self> {
        let weights = vb.get_with_hints((downsample,), "bias", Init::Const(0.0))?;
        Ok(Self {
            weights,
            downsample,
        })
    }

    /// `(seq_len, batch, channels)` →
    /// `(ceil(seq_len / downsample), batch, channels)`; the input is
    /// right-padded by repeating its last frame.
    pub fn forward(&self, src: &Tensor) -> Result<Tensor> {
        let (seq_len, batch, channels) = src.dims3()?;
        let ds = self.downsample;
        let d_seq_len = seq_len.div_ceil(ds);

        let pad = d_seq_len * ds - seq_len;
        let src = if pad > 0 {
            let last = src
                .narrow(0, seq_len - 1, 1)?
                .broadcast_as((pad, batch, channels))?
                .contiguous()?;
            Tensor::cat(&[src, &last], 0)?
        } else {
            src.clone()
        };

        let src = src.reshape((d_seq_len, ds, batch, channels))?;
        let weights = nn::ops::softmax(&self.weights, 0)?.reshape((1, ds, 1, 1))?;
        Ok(src.broadcast_mul(&weights)?.sum(1)?)
    }
}

/// Upsampling by plain repetition of each frame.
#[derive(Debug, Clone)]
pub struct SimpleUpsample {
    upsample: usize,
}

impl SimpleUpsample {
    pub fn new(upsample: usize) -> Self {
        Self { upsample }
    }

    /// `(seq_len, batch, channels)` → `(seq_len * upsample, batch, channels)`.
    pub fn forward(&self, src: &Tensor) -> Result<Tensor> {
        let (seq_len, batch, channels) = src.dims3()?;
        let ups = self.upsample;
        let src = src
            .unsqueeze(1)?
            .broadcast_as((seq_len, ups, batch, channels))?
            .contiguous()?
            .reshape((seq_len * ups, batch, channels))?;
        Ok(src)
    }
}

/// An encoder stack evaluated at a reduced frame rate: downsample, run the
/// inner stack, upsample back, and blend with the full-rate input through a
/// bypass gate. Output length always equals input length exactly.
#[derive(Debug)]
pub struct DownsampledZipformerEncoder {
    downsample_factor: usize,
    downsample: SimpleDownsample,
    encoder: ZipformerEncoder,
    upsample: SimpleUpsample,
    out_combiner: BypassModule,
}

impl DownsampledZipformerEncoder {
    pub fn new(
        encoder: ZipformerEncoder,
        dim: usize,
        downsample: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            downsample_factor: downsample,
            downsample: SimpleDownsample::new(downsample, vb.pp("downsample"))?,
            encoder,
            upsample: SimpleUpsample::new(downsample),
            out_combiner: BypassModule::without_skip(dim, vb.pp("out_combiner"))?,
        })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        time_emb: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        src_key_padding_mask: Option<&Tensor>,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let src_orig = src.clone();
        let ds = self.downsample_factor;
        let src = self.downsample.forward(src)?;

        let time_emb = match time_emb {
            Some(te) if te.rank() == 3 => Some(stride_select(te, 0, ds)?),
            Some(te) => Some(te.clone()),
            None => None,
        };
        let attn_mask = match attn_mask {
            Some(m) => {
                let m = stride_select(m, m.rank() - 2, ds)?;
                Some(stride_select(&m, m.rank() - 1, ds)?)
            }
            None => None,
        };
        let src_key_padding_mask = match src_key_padding_mask {
            Some(m) => Some(stride_select(m, m.rank() - 1, ds)?),
            None => None,
        };

        let src = self.encoder.forward(
            &src,
            time_emb.as_ref(),
            attn_mask.as_ref(),
            src_key_padding_mask.as_ref(),
            train,
        )?;
        let src = self.upsample.forward(&src)?;
        // Drop the frames introduced by the right-padding in the downsample.
        let src = src.narrow(0, 0, src_orig.dim(0)?)?;

        self.out_combiner.forward(&src_orig, &src, train)
    }
}
