//! The TTS Zipformer encoder.
//!
//! A cascade of encoder stacks over a U-Net downsampling schedule such as
//! `(1, 2, 4, 2, 1)`: the input is projected into the residual stream, each
//! stack refines it at its own frame rate (blending back through a learned
//! bypass), and a final projection maps to the output dimension. The whole
//! cascade is conditioned on a flow-matching timestep and, optionally, a
//! classifier-free-guidance scale.
//!
//! Layout of the per-stack warmup phases and all stochastic regularization
//! schedules follows the training recipe the stored checkpoints were
//! produced with, so loaded weights behave identically here.

pub mod attention;
pub mod bypass;
pub mod convolution;
pub mod encoder;
pub mod feedforward;
pub mod layer;
pub mod ops;
pub mod pos_embed;
pub mod schedule;
pub mod timestep;

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{self as nn, VarBuilder};

use self::encoder::{DownsampledZipformerEncoder, ZipformerEncoder};
use self::timestep::{timestep_embedding, TimeEmbed};
use crate::{Error, Result, ZipformerConfig};

pub use self::schedule::{ScheduledFloat, TrainingContext};

/// One entry of the encoder cascade, with the frame-rate adaptation
/// resolved at construction.
#[derive(Debug)]
enum EncoderStack {
    FullRate(ZipformerEncoder),
    Downsampled(DownsampledZipformerEncoder),
}

impl EncoderStack {
    fn forward(
        &self,
        src: &Tensor,
        time_emb: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        src_key_padding_mask: Option<&Tensor>,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        match self {
            Self::FullRate(enc) => enc.forward(src, time_emb, attn_mask, src_key_padding_mask, train),
            Self::Downsampled(enc) => {
                enc.forward(src, time_emb, attn_mask, src_key_padding_mask, train)
            }
        }
    }
}

/// The top-level encoder.
#[derive(Debug)]
pub struct TtsZipformer {
    cfg: ZipformerConfig,
    in_proj: nn::Linear,
    out_proj: nn::Linear,
    encoders: Vec<EncoderStack>,
    time_embed: Option<TimeEmbed>,
    guidance_scale_embed: Option<nn::Linear>,
}

impl TtsZipformer {
    /// Build the encoder, validating the configuration. Fresh parameters
    /// come from the builder's initializer; stored checkpoints load by
    /// passing a safetensors-backed builder (see [`Self::from_safetensors`]).
    pub fn new(cfg: &ZipformerConfig, vb: VarBuilder) -> Result<Self> {
        let cfg = cfg.validated()?;
        let num_stacks = cfg.num_stacks();

        let in_proj = nn::linear(cfg.in_dim, cfg.encoder_dim, vb.pp("in_proj"))?;
        let out_proj = nn::linear(cfg.encoder_dim, cfg.out_dim, vb.pp("out_proj"))?;

        let mut encoders = Vec::with_capacity(num_stacks);
        for i in 0..num_stacks {
            let vb_i = vb.pp(format!("encoders.{i}"));
            let ds = cfg.downsampling_factor[i];
            // Stacks warm up one after another; deeper-downsampled stacks
            // keep a slightly higher final layer-skip rate.
            let warmup_begin = cfg.warmup_batches * (i + 1) as f64 / (num_stacks + 1) as f64;
            let warmup_end = cfg.warmup_batches * (i + 2) as f64 / (num_stacks + 1) as f64;
            let final_layerdrop_rate = 0.035 * (ds as f64).sqrt();

            let stack = if ds == 1 {
                EncoderStack::FullRate(ZipformerEncoder::new(
                    &cfg,
                    cfg.num_encoder_layers[i],
                    cfg.cnn_module_kernel[i],
                    warmup_begin,
                    warmup_end,
                    final_layerdrop_rate,
                    vb_i,
                )?)
            } else {
                let inner = ZipformerEncoder::new(
                    &cfg,
                    cfg.num_encoder_layers[i],
                    cfg.cnn_module_kernel[i],
                    warmup_begin,
                    warmup_end,
                    final_layerdrop_rate,
                    vb_i.pp("encoder"),
                )?;
                EncoderStack::Downsampled(DownsampledZipformerEncoder::new(
                    inner,
                    cfg.encoder_dim,
                    ds,
                    vb_i,
                )?)
            };
            encoders.push(stack);
        }

        let time_embed = if cfg.use_time_embed {
            Some(TimeEmbed::new(cfg.time_embed_dim, vb.pp("time_embed"))?)
        } else {
            None
        };
        let guidance_scale_embed = if cfg.use_guidance_scale_embed {
            Some(ops::scaled_linear_no_bias(
                cfg.guidance_scale_embed_dim,
                cfg.time_embed_dim,
                0.1,
                vb.pp("guidance_scale_embed"),
            )?)
        } else {
            None
        };

        Ok(Self {
            cfg,
            in_proj,
            out_proj,
            encoders,
            time_embed,
            guidance_scale_embed,
        })
    }

    /// Load from a safetensors checkpoint.
    pub fn from_safetensors<P: AsRef<Path>>(
        path: P,
        cfg: &ZipformerConfig,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        Self::new(cfg, vb)
    }

    /// The validated configuration the model was built with.
    pub fn config(&self) -> &ZipformerConfig {
        &self.cfg
    }

    /// Encode a batch of feature sequences.
    ///
    /// - `x`: `(batch, seq_len, in_dim)`
    /// - `t`: timestep, `(batch,)` or per-frame `(batch, seq_len)`;
    ///   required iff the model was built with time conditioning
    /// - `padding_mask`: U8 `(batch, seq_len)`, nonzero marks positions
    ///   excluded as attention sources
    /// - `guidance_scale`: same shapes as `t`; requires the guidance
    ///   embedding to be enabled
    /// - `train`: training context for the stochastic regularizers; `None`
    ///   makes the call fully deterministic
    ///
    /// Returns `(batch, seq_len, out_dim)`.
    pub fn forward(
        &self,
        x: &Tensor,
        t: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
        guidance_scale: Option<&Tensor>,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let x = x.transpose(0, 1)?.contiguous()?; // (seq, batch, in_dim)
        let x = x.apply(&self.in_proj)?;

        let time_emb = match (&self.time_embed, t) {
            (Some(embed), Some(t)) => {
                let mut te = timestep_embedding(t, self.cfg.time_embed_dim)?.to_dtype(x.dtype())?;
                if let Some(gs) = guidance_scale {
                    let proj = self.guidance_scale_embed.as_ref().ok_or_else(|| {
                        Error::Config(
                            "guidance scale given but use_guidance_scale_embed is disabled".into(),
                        )
                    })?;
                    let gs_emb =
                        timestep_embedding(gs, self.cfg.guidance_scale_embed_dim)?
                            .to_dtype(x.dtype())?
                            .apply(proj)?;
                    te = te.broadcast_add(&gs_emb)?;
                }
                Some(embed.forward(&te)?)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Config(
                    "model was built with time conditioning; a timestep is required".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Config(
                    "model was built without time conditioning".into(),
                ))
            }
        };

        // Full bidirectional attention within the unmasked region: only the
        // padding mask restricts attention sources.
        let attn_mask: Option<&Tensor> = None;

        let mut x = x;
        for stack in &self.encoders {
            x = stack.forward(&x, time_emb.as_ref(), attn_mask, padding_mask, train)?;
        }

        let x = x.apply(&self.out_proj)?;
        Ok(x.transpose(0, 1)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn small_cfg() -> ZipformerConfig {
        ZipformerConfig {
            in_dim: 16,
            out_dim: 10,
            downsampling_factor: vec![1, 2, 1],
            num_encoder_layers: vec![1],
            cnn_module_kernel: vec![7],
            encoder_dim: 64,
            num_heads: 4,
            query_head_dim: 8,
            pos_head_dim: 4,
            value_head_dim: 8,
            feedforward_dim: 96,
            pos_dim: 48,
            time_embed_dim: 32,
            ..Default::default()
        }
    }

    fn make_model(cfg: &ZipformerConfig) -> TtsZipformer {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        TtsZipformer::new(cfg, vb).unwrap()
    }

    #[test]
    fn rejects_invalid_schedule_at_construction() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = ZipformerConfig {
            downsampling_factor: vec![2, 4, 4],
            ..small_cfg()
        };
        assert!(TtsZipformer::new(&cfg, vb).is_err());
    }

    #[test]
    fn end_to_end_shape_and_finiteness() {
        let dev = Device::Cpu;
        let model = make_model(&small_cfg());
        let x = Tensor::randn(0f32, 1.0, (2, 17, 16), &dev).unwrap();
        let t = Tensor::new(&[0.5f32, 0.8], &dev).unwrap();
        let mask = Tensor::zeros((2, 17), DType::U8, &dev).unwrap();
        let y = model
            .forward(&x, Some(&t), Some(&mask), None, None)
            .unwrap();
        assert_eq!(y.dims(), &[2, 17, 10]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()), "output contains NaN/Inf");
    }

    #[test]
    fn inference_is_bit_reproducible() {
        let dev = Device::Cpu;
        let model = make_model(&small_cfg());
        let x = Tensor::randn(0f32, 1.0, (2, 11, 16), &dev).unwrap();
        let t = Tensor::new(&[0.25f32, 0.75], &dev).unwrap();
        let a: Vec<f32> = model
            .forward(&x, Some(&t), None, None, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = model
            .forward(&x, Some(&t), None, None, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn per_frame_timestep_is_accepted() {
        let dev = Device::Cpu;
        let model = make_model(&small_cfg());
        let x = Tensor::randn(0f32, 1.0, (2, 8, 16), &dev).unwrap();
        let t = Tensor::randn(0f32, 1.0, (2, 8), &dev).unwrap();
        let y = model.forward(&x, Some(&t), None, None, None).unwrap();
        assert_eq!(y.dims(), &[2, 8, 10]);
    }

    #[test]
    fn guidance_scale_requires_embedding() {
        let dev = Device::Cpu;
        let model = make_model(&small_cfg());
        let x = Tensor::randn(0f32, 1.0, (1, 5, 16), &dev).unwrap();
        let t = Tensor::new(&[0.5f32], &dev).unwrap();
        let gs = Tensor::new(&[2.0f32], &dev).unwrap();
        assert!(model.forward(&x, Some(&t), None, Some(&gs), None).is_err());
    }

    #[test]
    fn guidance_scale_embedding_path() {
        let dev = Device::Cpu;
        let cfg = ZipformerConfig {
            use_guidance_scale_embed: true,
            ..small_cfg()
        };
        let model = make_model(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 6, 16), &dev).unwrap();
        let t = Tensor::new(&[0.5f32, 0.1], &dev).unwrap();
        let gs = Tensor::new(&[2.0f32, 2.0], &dev).unwrap();
        let y = model.forward(&x, Some(&t), None, Some(&gs), None).unwrap();
        assert_eq!(y.dims(), &[2, 6, 10]);
    }

    #[test]
    fn missing_timestep_is_an_error() {
        let dev = Device::Cpu;
        let model = make_model(&small_cfg());
        let x = Tensor::randn(0f32, 1.0, (1, 5, 16), &dev).unwrap();
        assert!(model.forward(&x, None, None, None, None).is_err());
    }

    #[test]
    fn unconditioned_model_runs_without_timestep() {
        let dev = Device::Cpu;
        let cfg = ZipformerConfig {
            use_time_embed: false,
            ..small_cfg()
        };
        let model = make_model(&cfg);
        let x = Tensor::randn(0f32, 1.0, (1, 9, 16), &dev).unwrap();
        let y = model.forward(&x, None, None, None, None).unwrap();
        assert_eq!(y.dims(), &[1, 9, 10]);
    }

    #[test]
    fn training_mode_end_to_end() {
        let dev = Device::Cpu;
        let model = make_model(&small_cfg());
        let x = Tensor::randn(0f32, 1.0, (3, 13, 16), &dev).unwrap();
        let t = Tensor::new(&[0.1f32, 0.5, 0.9], &dev).unwrap();
        let ctx = TrainingContext::new(2000.0, 99);
        let y = model
            .forward(&x, Some(&t), None, None, Some(&ctx))
            .unwrap();
        assert_eq!(y.dims(), &[3, 13, 10]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));
    }
}
