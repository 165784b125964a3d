//! Model configuration.
//!
//! All hyperparameters of the Zipformer encoder, deserializable from JSON.
//! Defaults match the flow-matching decoder of the deployed ZipVoice model.
//!
//! Per-stack parameters (`num_encoder_layers`, `cnn_module_kernel`) may be
//! given as a single element, in which case they are expanded to the length
//! of `downsampling_factor` by [`ZipformerConfig::validated`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for [`TtsZipformer`](crate::TtsZipformer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipformerConfig {
    /// Input feature dimension (fbank bins).
    #[serde(default = "default_feat_dim")]
    pub in_dim: usize,

    /// Output feature dimension.
    #[serde(default = "default_feat_dim")]
    pub out_dim: usize,

    /// Per-stack downsampling factors. Must follow a U-Net schedule:
    /// first and last factor 1, doubling up to the midpoint, then halving.
    #[serde(default = "default_downsampling_factor")]
    pub downsampling_factor: Vec<usize>,

    /// Encoder layers per stack (single element = same for all stacks).
    #[serde(default = "default_num_encoder_layers")]
    pub num_encoder_layers: Vec<usize>,

    /// Convolution kernel size per stack (single element = same for all).
    /// Each kernel must be odd for SAME padding.
    #[serde(default = "default_cnn_module_kernel")]
    pub cnn_module_kernel: Vec<usize>,

    /// Residual-stream dimension, shared by all stacks.
    #[serde(default = "default_encoder_dim")]
    pub encoder_dim: usize,

    /// Query/key dimension per attention head.
    #[serde(default = "default_query_head_dim")]
    pub query_head_dim: usize,

    /// Projected positional-encoding dimension per attention head.
    #[serde(default = "default_pos_head_dim")]
    pub pos_head_dim: usize,

    /// Value dimension per attention head.
    #[serde(default = "default_value_head_dim")]
    pub value_head_dim: usize,

    /// Number of attention heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Hidden dimension of the full-width feed-forward module; the three
    /// feed-forward modules per layer use 3/4, 1 and 5/4 of this.
    #[serde(default = "default_feedforward_dim")]
    pub feedforward_dim: usize,

    /// Dimension of the relative positional encoding before projection.
    /// Must be even.
    #[serde(default = "default_pos_dim")]
    pub pos_dim: usize,

    /// Warmup horizon in training batches; controls the per-layer
    /// layer-skip schedules.
    #[serde(default = "default_warmup_batches")]
    pub warmup_batches: f64,

    /// Whether the encoder is conditioned on a diffusion timestep.
    #[serde(default = "default_true")]
    pub use_time_embed: bool,

    /// Dimension of the sinusoidal time embedding.
    #[serde(default = "default_embed_dim")]
    pub time_embed_dim: usize,

    /// Whether a classifier-free-guidance scale is embedded and summed
    /// into the time embedding.
    #[serde(default)]
    pub use_guidance_scale_embed: bool,

    /// Dimension of the sinusoidal guidance-scale embedding.
    #[serde(default = "default_embed_dim")]
    pub guidance_scale_embed_dim: usize,

    /// Whether each encoder layer carries its two convolution modules.
    #[serde(default = "default_true")]
    pub use_conv: bool,
}

impl Default for ZipformerConfig {
    fn default() -> Self {
        Self {
            in_dim: default_feat_dim(),
            out_dim: default_feat_dim(),
            downsampling_factor: default_downsampling_factor(),
            num_encoder_layers: default_num_encoder_layers(),
            cnn_module_kernel: default_cnn_module_kernel(),
            encoder_dim: default_encoder_dim(),
            query_head_dim: default_query_head_dim(),
            pos_head_dim: default_pos_head_dim(),
            value_head_dim: default_value_head_dim(),
            num_heads: default_num_heads(),
            feedforward_dim: default_feedforward_dim(),
            pos_dim: default_pos_dim(),
            warmup_batches: default_warmup_batches(),
            use_time_embed: default_true(),
            time_embed_dim: default_embed_dim(),
            use_guidance_scale_embed: false,
            guidance_scale_embed_dim: default_embed_dim(),
            use_conv: default_true(),
        }
    }
}

impl ZipformerConfig {
    /// Number of encoder stacks, one per downsampling factor.
    pub fn num_stacks(&self) -> usize {
        self.downsampling_factor.len()
    }

    /// Validate the configuration and expand single-element per-stack
    /// parameters to the schedule length.
    ///
    /// All violations are construction errors; nothing is recoverable at
    /// forward time.
    pub fn validated(&self) -> Result<Self> {
        let mut cfg = self.clone();
        validate_downsampling_schedule(&cfg.downsampling_factor)?;
        let n = cfg.num_stacks();
        cfg.num_encoder_layers = expand_per_stack(&cfg.num_encoder_layers, n, "num_encoder_layers")?;
        cfg.cnn_module_kernel = expand_per_stack(&cfg.cnn_module_kernel, n, "cnn_module_kernel")?;

        for &k in &cfg.cnn_module_kernel {
            if k % 2 == 0 {
                return Err(Error::Config(format!(
                    "cnn_module_kernel must be odd for SAME padding, got {k}"
                )));
            }
        }
        if cfg.pos_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "pos_dim must be even, got {}",
                cfg.pos_dim
            )));
        }
        if cfg.use_time_embed && cfg.time_embed_dim == 0 {
            return Err(Error::Config(
                "use_time_embed requires a nonzero time_embed_dim".into(),
            ));
        }
        if cfg.use_guidance_scale_embed {
            if !cfg.use_time_embed {
                return Err(Error::Config(
                    "guidance-scale embedding is summed into the time embedding; \
                     use_time_embed must be enabled"
                        .into(),
                ));
            }
            if cfg.guidance_scale_embed_dim == 0 {
                return Err(Error::Config(
                    "use_guidance_scale_embed requires a nonzero guidance_scale_embed_dim".into(),
                ));
            }
        }
        Ok(cfg)
    }
}

/// Check that the factors follow the U-Net shape: 1 at both ends, doubling
/// up to the midpoint, halving back down.
fn validate_downsampling_schedule(factors: &[usize]) -> Result<()> {
    let bad = |msg: String| Err(Error::Config(format!("downsampling_factor {factors:?}: {msg}")));
    if factors.is_empty() {
        return bad("schedule is empty".into());
    }
    if factors[0] != 1 || factors[factors.len() - 1] != 1 {
        return bad("first and last factor must be 1".into());
    }
    let mid = factors.len() / 2;
    for i in 1..=mid {
        if factors[i] != factors[i - 1] * 2 {
            return bad(format!("factor at index {i} must double the previous one"));
        }
    }
    for i in mid + 1..factors.len() {
        if factors[i] * 2 != factors[i - 1] {
            return bad(format!("factor at index {i} must halve the previous one"));
        }
    }
    Ok(())
}

fn expand_per_stack(values: &[usize], n: usize, name: &str) -> Result<Vec<usize>> {
    match values.len() {
        1 => Ok(vec![values[0]; n]),
        len if len == n => Ok(values.to_vec()),
        len => Err(Error::Config(format!(
            "{name} has {len} entries but the downsampling schedule has {n}"
        ))),
    }
}

fn default_feat_dim() -> usize {
    100
}
fn default_downsampling_factor() -> Vec<usize> {
    vec![1, 2, 4, 2, 1]
}
fn default_num_encoder_layers() -> Vec<usize> {
    vec![4]
}
fn default_cnn_module_kernel() -> Vec<usize> {
    vec![31]
}
fn default_encoder_dim() -> usize {
    384
}
fn default_query_head_dim() -> usize {
    24
}
fn default_pos_head_dim() -> usize {
    4
}
fn default_value_head_dim() -> usize {
    12
}
fn default_num_heads() -> usize {
    8
}
fn default_feedforward_dim() -> usize {
    1536
}
fn default_pos_dim() -> usize {
    192
}
fn default_warmup_batches() -> f64 {
    4000.0
}
fn default_embed_dim() -> usize {
    192
}
fn default_true() -> bool {
    true
}
