//! Compact relative positional encoding.
//!
//! Encodes the signed time offset between two frames in a small number of
//! dimensions by log-compressing large offsets, squashing through atan onto
//! a finite interval, and taking Fourier features of the result. Nearby
//! offsets stay clearly separated; offsets of e.g. 1000 vs 1001 map to
//! nearly identical embeddings, which is the right behavior for relative
//! (as opposed to absolute) position.
//!
//! The table for offsets `-(T-1)..=(T-1)` is computed once and cached; a
//! later request with a smaller `T` reuses the cached table, a larger `T`
//! regenerates a center-aligned superset.

use std::cell::RefCell;

use candle_core::{DType, Device, Tensor};

use super::schedule::TrainingContext;
use crate::{Error, Result};

#[derive(Debug)]
pub struct CompactRelPositionalEncoding {
    embed_dim: usize,
    dropout_rate: f64,
    length_factor: f64,
    // Cached table of shape (2 * max_seen_len - 1, embed_dim), f32.
    pe: RefCell<Option<Tensor>>,
}

impl CompactRelPositionalEncoding {
    /// `embed_dim` must be even; `length_factor >= 1.0` trades resolution
    /// near the origin against resolution at large offsets.
    pub fn new(embed_dim: usize, dropout_rate: f64, length_factor: f64) -> Result<Self> {
        if embed_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "positional encoding dim must be even, got {embed_dim}"
            )));
        }
        if length_factor < 1.0 {
            return Err(Error::Config(format!(
                "length_factor must be >= 1.0, got {length_factor}"
            )));
        }
        Ok(Self {
            embed_dim,
            dropout_rate,
            length_factor,
            pe: RefCell::new(None),
        })
    }

    /// Full table for offsets `-(seq_len-1)..=(seq_len-1)`, row 0 holding
    /// the most negative offset and the center row offset 0.
    fn build_table(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let dim = self.embed_dim;
        let half = dim / 2;
        let rows = 2 * seq_len - 1;

        // Offsets are log-compressed so that the derivative is 1 at the
        // origin, then squashed to (-pi/2, pi/2) by atan.
        let compression_length = (dim as f64).sqrt();
        let length_scale = self.length_factor * dim as f64 / (2.0 * std::f64::consts::PI);

        let mut data = vec![0f32; rows * dim];
        for (row, chunk) in data.chunks_mut(dim).enumerate() {
            let x = row as f64 - (seq_len as f64 - 1.0);
            let x_compressed = compression_length
                * x.signum()
                * ((x.abs() + compression_length).ln() - compression_length.ln());
            let x_atan = (x_compressed / length_scale).atan();
            for k in 0..half {
                let angle = x_atan * (k + 1) as f64;
                chunk[2 * k] = angle.cos() as f32;
                chunk[2 * k + 1] = angle.sin() as f32;
            }
            // Last channel is a constant 1, acting as a bias term for the
            // position projection.
            chunk[dim - 1] = 1.0;
        }
        Ok(Tensor::from_vec(data, (rows, dim), device)?)
    }

    /// Positional embedding of shape `(1, 2*seq_len - 1, embed_dim)`,
    /// covering every relative offset two frames of the sequence can have.
    pub fn forward(
        &self,
        seq_len: usize,
        dtype: DType,
        device: &Device,
        train: Option<&TrainingContext>,
    ) -> Result<Tensor> {
        let needed = 2 * seq_len - 1;
        let cached_ok = self
            .pe
            .borrow()
            .as_ref()
            .map(|pe| pe.dim(0).unwrap_or(0) >= needed)
            .unwrap_or(false);
        if !cached_ok {
            *self.pe.borrow_mut() = Some(self.build_table(seq_len, device)?);
        }

        let pe_guard = self.pe.borrow();
        let pe = pe_guard
            .as_ref()
            .ok_or_else(|| Error::Config("positional-encoding cache is empty".into()))?;
        let center = pe.dim(0)? / 2;
        let pos_emb = pe
            .narrow(0, center + 1 - seq_len, needed)?
            .to_dtype(dtype)?
            .unsqueeze(0)?;
        match train {
            Some(ctx) => ctx.dropout(&pos_emb, self.dropout_rate),
            None => Ok(pos_emb),
        }
    }

    #[cfg(test)]
    fn cached_rows(&self) -> usize {
        self.pe
            .borrow()
            .as_ref()
            .map(|pe| pe.dim(0).unwrap())
            .unwrap_or(0)
    }
}
