//! Training-step schedules and the stochastic-gate context.
//!
//! The encoder's regularizers (layer skipping, sequence dropout, constant
//! attention) are driven by rates that decay as training progresses. The
//! original formulation reads a global batch counter from ambient state; here
//! the counter is carried explicitly by [`TrainingContext`] and passed into
//! every forward call. Inference passes `None` and every stochastic rate
//! resolves to zero, making the forward pass bit-reproducible.

use std::cell::RefCell;

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::Result;

/// A float that is a piecewise-linear function of the training batch index.
///
/// Flat extrapolation outside the breakpoints: before the first point the
/// value is the first value, after the last point the last value.
#[derive(Debug, Clone)]
pub struct ScheduledFloat {
    points: Vec<(f64, f64)>,
}

impl ScheduledFloat {
    /// Build from `(batch_index, value)` breakpoints, sorted by batch index.
    pub fn new(points: &[(f64, f64)]) -> Self {
        debug_assert!(!points.is_empty());
        debug_assert!(points.windows(2).all(|w| w[0].0 <= w[1].0));
        Self {
            points: points.to_vec(),
        }
    }

    /// A schedule that is the same value at every step.
    pub fn constant(value: f64) -> Self {
        Self {
            points: vec![(0.0, value)],
        }
    }

    /// Evaluate the schedule at the given batch index.
    pub fn value_at(&self, batch: f64) -> f64 {
        let first = self.points[0];
        if batch <= first.0 {
            return first.1;
        }
        for w in self.points.windows(2) {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            if batch <= x1 {
                if x1 == x0 {
                    return y1;
                }
                return y0 + (y1 - y0) * (batch - x0) / (x1 - x0);
            }
        }
        self.points[self.points.len() - 1].1
    }

    /// The rate to use for a stochastic gate: scheduled value during
    /// training, zero at inference.
    pub fn rate(&self, train: Option<&TrainingContext>) -> f64 {
        match train {
            Some(ctx) => self.value_at(ctx.batch()),
            None => 0.0,
        }
    }
}

/// Per-call training state: the externally-owned global batch counter plus a
/// seeded RNG from which every stochastic gate draws.
///
/// Construct one per training step; forward calls that receive `None`
/// instead are fully deterministic.
pub struct TrainingContext {
    batch: f64,
    rng: RefCell<ChaCha8Rng>,
}

impl TrainingContext {
    pub fn new(batch: f64, seed: u64) -> Self {
        Self {
            batch,
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// The global training batch index driving all schedules.
    pub fn batch(&self) -> f64 {
        self.batch
    }

    /// One Bernoulli draw with probability `p`.
    pub(crate) fn coin(&self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        self.rng.borrow_mut().random::<f64>() < p
    }

    /// Per-sequence keep mask of shape `(batch_size, 1)`: 1.0 with
    /// probability `1 - drop_rate`, else 0.0. `None` when the rate is zero.
    pub(crate) fn keep_mask(
        &self,
        batch_size: usize,
        drop_rate: f64,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        if drop_rate <= 0.0 {
            return Ok(None);
        }
        let mut rng = self.rng.borrow_mut();
        let vals: Vec<f32> = (0..batch_size)
            .map(|_| if rng.random::<f64>() > drop_rate { 1.0 } else { 0.0 })
            .collect();
        Ok(Some(Tensor::from_vec(vals, (batch_size, 1), device)?))
    }

    /// Per-sequence 0/1 mask of shape `(batch_size, 1)`: 1.0 with
    /// probability `p` (used for straight-through overrides).
    pub(crate) fn bernoulli_mask(
        &self,
        batch_size: usize,
        p: f64,
        device: &Device,
    ) -> Result<Tensor> {
        let mut rng = self.rng.borrow_mut();
        let vals: Vec<f32> = (0..batch_size)
            .map(|_| if rng.random::<f64>() < p { 1.0 } else { 0.0 })
            .collect();
        Ok(Tensor::from_vec(vals, (batch_size, 1), device)?)
    }

    /// Elementwise inverted dropout with `1/(1-p)` scaling.
    pub(crate) fn dropout(&self, x: &Tensor, rate: f64) -> Result<Tensor> {
        if rate <= 0.0 {
            return Ok(x.clone());
        }
        let scale = (1.0 / (1.0 - rate)) as f32;
        let n = x.elem_count();
        let mut rng = self.rng.borrow_mut();
        let vals: Vec<f32> = (0..n)
            .map(|_| if rng.random::<f64>() < rate { 0.0 } else { scale })
            .collect();
        let mask = Tensor::from_vec(vals, x.dims(), x.device())?.to_dtype(x.dtype())?;
        Ok((x * mask)?)
    }

    /// Inverted dropout on `(time, batch, channels)` input with the mask
    /// shared along the time axis.
    pub(crate) fn dropout_time_shared(&self, x: &Tensor, rate: f64) -> Result<Tensor> {
        if rate <= 0.0 {
            return Ok(x.clone());
        }
        let (_t, b, c) = x.dims3()?;
        let scale = (1.0 / (1.0 - rate)) as f32;
        let mut rng = self.rng.borrow_mut();
        let vals: Vec<f32> = (0..b * c)
            .map(|_| if rng.random::<f64>() < rate { 0.0 } else { scale })
            .collect();
        let mask = Tensor::from_vec(vals, (1, b, c), x.device())?.to_dtype(x.dtype())?;
        Ok(x.broadcast_mul(&mask)?)
    }
}
