//! Depthwise convolution module of the encoder layer.
//!
//! `Linear(d, 2d)` → sigmoid-gated split → depthwise 1-D convolution over
//! time (SAME padding, odd kernel) → SwooshR → `Linear(d, d)`. Padded
//! source frames are zeroed before the convolution so they cannot leak into
//! their neighbors' receptive fields.

use candle_core::Tensor;
use candle_nn::{self as nn, Conv1d, Conv1dConfig, VarBuilder};

use super::ops::{masked_fill, scaled_linear, swoosh_r};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConvolutionModule {
    in_proj: nn::Linear,
    depthwise_conv: Conv1d,
    out_proj: nn::Linear,
}

impl ConvolutionModule {
    pub fn new(channels: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        if kernel_size % 2 == 0 {
            return Err(Error::Config(format!(
                "depthwise kernel must be odd for SAME padding, got {kernel_size}"
            )));
        }
        let in_proj = nn::linear(channels, 2 * channels, vb.pp("in_proj"))?;
        let conv_cfg = Conv1dConfig {
            padding: kernel_size / 2,
            groups: channels,
            ..Default::default()
        };
        let depthwise_conv = nn::conv1d(
            channels,
            channels,
            kernel_size,
            conv_cfg,
            vb.pp("depthwise_conv"),
        )?;
        let out_proj = scaled_linear(channels, channels, 0.05, vb.pp("out_proj"))?;
        Ok(Self {
            in_proj,
            depthwise_conv,
            out_proj,
        })
    }

    /// - `x`: `(seq_len, batch, channels)`
    /// - `src_key_padding_mask`: U8 `(batch, seq_len)`, nonzero = masked
    pub fn forward(&self, x: &Tensor, src_key_padding_mask: Option<&Tensor>) -> Result<Tensor> {
        let x = x.apply(&self.in_proj)?; // (time, batch, 2*channels)

        let chunks = x.chunk(2, 2)?;
        let (x, s) = (&chunks[0], &chunks[1]);
        let s = nn::ops::sigmoid(s)?;
        let x = (x * s)?;

        // (time, batch, channels) -> (batch, channels, time)
        let mut x = x.permute((1, 2, 0))?.contiguous()?;

        if let Some(mask) = src_key_padding_mask {
            // (batch, time) -> (batch, 1, time)
            x = masked_fill(&x, &mask.unsqueeze(1)?, 0.0)?;
        }

        let x = x.apply(&self.depthwise_conv)?;

        // (batch, channels, time) -> (time, batch, channels)
        let x = x.permute((2, 0, 1))?.contiguous()?;
        let x = swoosh_r(&x)?;
        Ok(x.apply(&self.out_proj)?)
    }
}
