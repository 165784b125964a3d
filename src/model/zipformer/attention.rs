//! Attention for the Zipformer encoder layer.
//!
//! Unlike a conventional transformer block, attention is split in two:
//! [`RelPositionMultiheadAttentionWeights`] computes the softmaxed
//! `(heads, batch, tgt, src)` weight tensor once per layer call, and the
//! cheap consumers — [`SelfAttention`] twice and [`NonlinAttention`] once —
//! reuse it. Derived from Transformer-XL style relative position scoring.

use candle_core::{DType, Tensor, D};
use candle_nn::{self as nn, VarBuilder};

use super::ops::{masked_fill, scaled_linear, scaled_linear_no_bias};
use super::schedule::{ScheduledFloat, TrainingContext};
use crate::Result;

/// Gather indices converting relative-offset indexing into absolute
/// `(tgt, src)` indexing: entry `(i, j)` selects relative index
/// `(seq_len - 1) - i + j`, so index 0 is the largest negative offset
/// (attending to the most time-ago source) and `seq_len - 1` is offset 0.
pub(crate) fn rel_to_abs_indices(seq_len: usize) -> Vec<u32> {
    let mut idx = Vec::with_capacity(seq_len * seq_len);
    for i in 0..seq_len {
        for j in 0..seq_len {
            idx.push((seq_len - 1 - i + j) as u32);
        }
    }
    idx
}

/// Computes multi-head attention weights with relative positional encoding.
///
/// Query, key and position-query come from slices of one shared input
/// projection. The positional term projects the compact positional table
/// and is probabilistically skipped early in training; at inference it is
/// always applied.
#[derive(Debug, Clone)]
pub struct RelPositionMultiheadAttentionWeights {
    in_proj: nn::Linear,
    linear_pos: nn::Linear,
    num_heads: usize,
    query_head_dim: usize,
    pos_head_dim: usize,
    dropout: f64,
    pos_emb_skip_rate: ScheduledFloat,
}

impl RelPositionMultiheadAttentionWeights {
    pub fn new(
        embed_dim: usize,
        pos_dim: usize,
        num_heads: usize,
        query_head_dim: usize,
        pos_head_dim: usize,
        dropout: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let key_head_dim = query_head_dim;
        let in_proj_dim = (query_head_dim + key_head_dim + pos_head_dim) * num_heads;
        // The query/key scaling usually written as head_dim^-0.5 is folded
        // into the initialization, split evenly between query and key.
        let in_proj = scaled_linear(
            embed_dim,
            in_proj_dim,
            (query_head_dim as f64).powf(-0.25),
            vb.pp("in_proj"),
        )?;
        let linear_pos =
            scaled_linear_no_bias(pos_dim, num_heads * pos_head_dim, 0.05, vb.pp("linear_pos"))?;
        Ok(Self {
            in_proj,
            linear_pos,
            num_heads,
            query_head_dim,
            pos_head_dim,
            dropout,
            pos_emb_skip_rate: ScheduledFloat::new(&[(0.0, 0.5), (4000.0, 0.0)]),
        })
    }

    /// Compute the attention weights.
    ///
    /// - `x`: `(seq_len, batch, embed_dim)`
    /// - `pos_emb`: `(1, 2*seq_len - 1, pos_dim)`
    /// - `key_padding_mask`: U8 `(batch, seq_len)`, nonzero = masked source
    /// - `attn_mask`: U8 `(seq_len, seq_len)` or `(batch, seq_len, seq_len)`,
    ///   nonzero = masked `(tgt, src)` pair
    ///
    /// Returns `(num_heads, batch, seq_len, seq_len)`; each unmasked row is
    /// a probability simplex over the source axis.
    pub fn forward(
        &self,
        x: &Tensor,
        pos_emb: &Tensor,
        key_padding_mask: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let x = x.apply(&self.in_proj)?;
        let (seq_len, batch, _) = x.dims3()?;
        let h = self.num_heads;
        let qhd = self.query_head_dim;
        let phd = self.pos_head_dim;
        let query_dim = qhd * h;

        let q = x.narrow(2, 0, query_dim)?;
        let k = x.narrow(2, query_dim, query_dim)?;
        let p = x.narrow(2, 2 * query_dim, phd * h)?;

        // time1 = target, time2 = source.
        let q = q
            .reshape((seq_len, batch, h, qhd))?
            .permute((2, 1, 0, 3))?
            .contiguous()?; // (head, batch, time1, qhd)
        let k = k
            .reshape((seq_len, batch, h, qhd))?
            .permute((2, 1, 3, 0))?
            .contiguous()?; // (head, batch, qhd, time2)
        let p = p
            .reshape((seq_len, batch, h, phd))?
            .permute((2, 1, 0, 3))?
            .contiguous()?; // (head, batch, time1, phd)

        let mut attn_scores = q.matmul(&k)?;

        let use_pos_scores = match train {
            Some(ctx) => !ctx.coin(self.pos_emb_skip_rate.value_at(ctx.batch())),
            None => true,
        };
        if use_pos_scores {
            let n = 2 * seq_len - 1;
            let pos = pos_emb.apply(&self.linear_pos)?;
            let pos = pos
                .reshape((n, h, phd))?
                .permute((1, 2, 0))?
                .contiguous()?
                .unsqueeze(1)?; // (head, 1, phd, 2*time1 - 1)

            // (head, batch, time1, phd) x (head, 1, phd, n)
            //   -> (head, batch, time1, n), n indexing the relative offset.
            let pos_scores = p.broadcast_matmul(&pos)?;

            let idx = Tensor::from_vec(rel_to_abs_indices(seq_len), (seq_len, seq_len), x.device())?
                .unsqueeze(0)?
                .unsqueeze(0)?
                .broadcast_as((h, batch, seq_len, seq_len))?
                .contiguous()?;
            let pos_scores = pos_scores.contiguous()?.gather(&idx, 3)?;
            attn_scores = (attn_scores + pos_scores)?;
        }

        // -1000 rather than -inf so that a row that is fully masked by the
        // combination of both masks still softmaxes without producing NaN;
        // exp(-1000 - max) underflows to exactly zero for partially masked
        // rows, which the constant-attention substitution relies on.
        if let Some(mask) = attn_mask {
            let mask = match mask.rank() {
                2 => mask.unsqueeze(0)?,
                3 => mask.clone(),
                r => {
                    return Err(candle_core::Error::Msg(format!(
                        "attention mask must have rank 2 or 3, got rank {r}"
                    ))
                    .into())
                }
            };
            attn_scores = masked_fill(&attn_scores, &mask.unsqueeze(0)?, -1000.0)?;
        }
        if let Some(mask) = key_padding_mask {
            // (batch, time2) -> (1, batch, 1, time2)
            let mask = mask.unsqueeze(0)?.unsqueeze(2)?;
            attn_scores = masked_fill(&attn_scores, &mask, -1000.0)?;
        }

        let mut attn_weights = nn::ops::softmax_last_dim(&attn_scores)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            self.trace_attn_entropy(&attn_weights)?;
        }

        if self.dropout > 0.0 {
            if let Some(ctx) = train {
                attn_weights = ctx.dropout(&attn_weights, self.dropout)?;
            }
        }
        Ok(attn_weights)
    }

    /// Per-head mean entropy of the attention distribution, as a health
    /// diagnostic: near-zero entropy means the heads have collapsed.
    fn trace_attn_entropy(&self, attn_weights: &Tensor) -> Result<()> {
        let w = attn_weights.to_dtype(DType::F32)?;
        let ent = ((w.clone() + 1e-20)?.log()? * &w)?
            .sum(D::Minus1)?
            .mean(D::Minus1)?
            .mean(1)?
            .neg()?;
        let ent: Vec<f32> = ent.to_vec1()?;
        tracing::trace!(entropy = ?ent, "attention weight entropy per head");
        Ok(())
    }
}

/// The simplest possible attention: applies already-computed weights to a
/// value projection.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    in_proj: nn::Linear,
    out_proj: nn::Linear,
}

impl SelfAttention {
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        value_head_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_proj = nn::linear(embed_dim, num_heads * value_head_dim, vb.pp("in_proj"))?;
        let out_proj = scaled_linear(num_heads * value_head_dim, embed_dim, 0.05, vb.pp("out_proj"))?;
        Ok(Self { in_proj, out_proj })
    }

    /// - `x`: `(seq_len, batch, embed_dim)`
    /// - `attn_weights`: `(num_heads, batch, seq_len, seq_len)`, rows
    ///   summing to 1 over the source axis
    pub fn forward(&self, x: &Tensor, attn_weights: &Tensor) -> Result<Tensor> {
        let (seq_len, batch, _) = x.dims3()?;
        let num_heads = attn_weights.dim(0)?;

        let x = x.apply(&self.in_proj)?;
        let x = x
            .reshape((seq_len, batch, num_heads, ()))?
            .permute((2, 1, 0, 3))?
            .contiguous()?; // (head, batch, time, value_head_dim)
        let x = attn_weights.matmul(&x)?;
        let x = x
            .permute((2, 1, 0, 3))?
            .contiguous()?
            .reshape((seq_len, batch, ()))?;
        Ok(x.apply(&self.out_proj)?)
    }
}

/// Like a convolution module, but with the temporal mixing done by the
/// shared attention weights instead of an actual convolution.
///
/// Three-way split of one expanded projection into (gate, value,
/// multiplier): the tanh-bounded gate scales the value branch, the result
/// is mixed over time by the attention matrix, multiplied elementwise by
/// the third branch, and projected back down.
#[derive(Debug, Clone)]
pub struct NonlinAttention {
    in_proj: nn::Linear,
    out_proj: nn::Linear,
    hidden_channels: usize,
}

impl NonlinAttention {
    pub fn new(channels: usize, hidden_channels: usize, vb: VarBuilder) -> Result<Self> {
        let in_proj = nn::linear(channels, hidden_channels * 3, vb.pp("in_proj"))?;
        let out_proj = scaled_linear(hidden_channels, channels, 0.05, vb.pp("out_proj"))?;
        Ok(Self {
            in_proj,
            out_proj,
            hidden_channels,
        })
    }

    /// - `x`: `(seq_len, batch, channels)`
    /// - `attn_weights`: `(num_heads, batch, seq_len, seq_len)`; the caller
    ///   passes a single head, and `hidden_channels` must be divisible by
    ///   the head count
    pub fn forward(&self, x: &Tensor, attn_weights: &Tensor) -> Result<Tensor> {
        let x = x.apply(&self.in_proj)?;
        let (seq_len, batch, _) = x.dims3()?;

        let chunks = x.chunk(3, 2)?;
        let (s, x, y) = (&chunks[0], &chunks[1], &chunks[2]);

        let s = s.tanh()?;
        let x = (x * s)?;

        let num_heads = attn_weights.dim(0)?;
        let x = x
            .reshape((seq_len, batch, num_heads, ()))?
            .permute((2, 1, 0, 3))?
            .contiguous()?; // (head, batch, time, head_dim)
        let x = attn_weights.matmul(&x)?;
        let x = x
            .permute((2, 1, 0, 3))?
            .contiguous()?
            .reshape((seq_len, batch, self.hidden_channels))?;

        let x = (x * y)?;
        Ok(x.apply(&self.out_proj)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn make_weights(
        device: &Device,
    ) -> (
        RelPositionMultiheadAttentionWeights,
        super::super::pos_embed::CompactRelPositionalEncoding,
    ) {
        let (_varmap, vb) = make_vb(device);
        let attn = RelPositionMultiheadAttentionWeights::new(64, 48, 4, 8, 4, 0.0, vb.pp("attn"))
            .unwrap();
        let pos = super::super::pos_embed::CompactRelPositionalEncoding::new(48, 0.0, 1.0).unwrap();
        (attn, pos)
    }

    #[test]
    fn index_transform_matches_offset_convention() {
        // Relative index 0 must be the largest negative offset, i.e. the
        // last target frame attending to the first source frame; offset 0
        // (the diagonal) must map to index seq_len - 1.
        let t = 5;
        let idx = rel_to_abs_indices(t);
        let at = |i: usize, j: usize| idx[i * t + j];
        assert_eq!(at(t - 1, 0), 0, "most time-ago source");
        assert_eq!(at(0, t - 1), (2 * t - 2) as u32, "most future source");
        for i in 0..t {
            assert_eq!(at(i, i), (t - 1) as u32, "diagonal is offset zero");
        }
        // Moving the source one frame earlier decrements the index.
        assert_eq!(at(2, 1), at(2, 2) - 1);
    }

    #[test]
    fn weights_shape_and_rows_sum_to_one() {
        let dev = Device::Cpu;
        let (attn, pos) = make_weights(&dev);
        let x = Tensor::randn(0f32, 1.0, (7, 2, 64), &dev).unwrap();
        let pos_emb = pos.forward(7, DType::F32, &dev, None).unwrap();
        let w = attn.forward(&x, &pos_emb, None, None, None).unwrap();
        assert_eq!(w.dims(), &[4, 2, 7, 7]);
        let sums: Vec<f32> = w
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "row sum = {s}");
        }
    }

    #[test]
    fn padding_mask_zeroes_masked_sources() {
        let dev = Device::Cpu;
        let (attn, pos) = make_weights(&dev);
        let x = Tensor::randn(0f32, 1.0, (6, 2, 64), &dev).unwrap();
        let pos_emb = pos.forward(6, DType::F32, &dev, None).unwrap();
        // Sequence 0: last two frames padded; sequence 1: nothing padded.
        let mask = Tensor::new(&[[0u8, 0, 0, 0, 1, 1], [0, 0, 0, 0, 0, 0]], &dev).unwrap();
        let w = attn.forward(&x, &pos_emb, Some(&mask), None, None).unwrap();

        let w_vals = w.to_dtype(DType::F32).unwrap();
        // Masked sources must have exactly zero weight for every head/target.
        let masked = w_vals.narrow(1, 0, 1).unwrap().narrow(3, 4, 2).unwrap();
        let vals: Vec<f32> = masked.flatten_all().unwrap().to_vec1().unwrap();
        for v in vals {
            assert_eq!(v, 0.0);
        }
        // Rows still sum to 1 over the remaining sources.
        let sums: Vec<f32> = w_vals
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "row sum = {s}");
        }
    }

    #[test]
    fn attn_mask_excludes_pairs() {
        let dev = Device::Cpu;
        let (attn, pos) = make_weights(&dev);
        let x = Tensor::randn(0f32, 1.0, (4, 1, 64), &dev).unwrap();
        let pos_emb = pos.forward(4, DType::F32, &dev, None).unwrap();
        // Forbid target 0 from attending to source 3.
        let mut m = vec![0u8; 16];
        m[3] = 1;
        let mask = Tensor::from_vec(m, (4, 4), &dev).unwrap();
        let w = attn.forward(&x, &pos_emb, None, Some(&mask), None).unwrap();
        let v: Vec<f32> = w
            .narrow(2, 0, 1)
            .unwrap()
            .narrow(3, 3, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for x in v {
            assert_eq!(x, 0.0);
        }
    }

    #[test]
    fn inference_is_deterministic() {
        let dev = Device::Cpu;
        let (attn, pos) = make_weights(&dev);
        let x = Tensor::randn(0f32, 1.0, (5, 2, 64), &dev).unwrap();
        let pos_emb = pos.forward(5, DType::F32, &dev, None).unwrap();
        let a: Vec<f32> = attn
            .forward(&x, &pos_emb, None, None, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = attn
            .forward(&x, &pos_emb, None, None, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn self_attention_shape() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let sa = SelfAttention::new(64, 4, 12, vb.pp("sa")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (7, 2, 64), &dev).unwrap();
        // Uniform weights: every row averages over all positions.
        let w = Tensor::full(1.0f32 / 7.0, (4, 2, 7, 7), &dev).unwrap();
        let out = sa.forward(&x, &w).unwrap();
        assert_eq!(out.dims(), &[7, 2, 64]);
    }

    #[test]
    fn nonlin_attention_shape() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let na = NonlinAttention::new(64, 48, vb.pp("na")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (7, 2, 64), &dev).unwrap();
        let w = Tensor::full(1.0f32 / 7.0, (1, 2, 7, 7), &dev).unwrap();
        let out = na.forward(&x, &w).unwrap();
        assert_eq!(out.dims(), &[7, 2, 64]);
    }
}
