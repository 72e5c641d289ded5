//! Adaptive augmentation probability.
//!
//! The sign of the discriminator's logits on real images measures
//! overfitting: `r_t = E[sign(D(real))]`. The probability moves up when
//! `r_t` exceeds the target and down otherwise, by `n / ada_length` per
//! update, so it can traverse `[0, 1]` after `ada_length` images.

use mlx_rs::Array;
use stylekd_distributed::DistributedContext;

use crate::Result;

/// Calls between probability updates.
pub const ADA_UPDATE_EVERY: usize = 8;

/// Online controller for the augmentation probability.
#[derive(Debug, Clone)]
pub struct AdaptiveAugment {
    target: f32,
    length: usize,
    update_every: usize,
    sign_sum: f32,
    pred_count: f32,
    calls: usize,
    r_t_stat: f32,
    p: f32,
}

impl AdaptiveAugment {
    /// Create a controller starting from `p = 0`.
    pub fn new(target: f32, length: usize, update_every: usize) -> Self {
        Self {
            target,
            length: length.max(1),
            update_every: update_every.max(1),
            sign_sum: 0.0,
            pred_count: 0.0,
            calls: 0,
            r_t_stat: 0.0,
            p: 0.0,
        }
    }

    /// Current probability.
    pub fn probability(&self) -> f32 {
        self.p
    }

    /// Restore a probability, e.g. from a checkpoint.
    pub fn set_probability(&mut self, p: f32) {
        self.p = p.clamp(0.0, 1.0);
    }

    /// Last measured sign statistic.
    pub fn r_t_stat(&self) -> f32 {
        self.r_t_stat
    }

    /// Accumulate the signs of `real_pred`; every `update_every` calls,
    /// reduce across processes and move the probability.
    pub fn tune(&mut self, real_pred: &Array, ctx: &DistributedContext) -> Result<f32> {
        let preds = real_pred.as_dtype(mlx_rs::Dtype::Float32)?;
        preds.eval()?;
        let signs: f32 = preds
            .as_slice::<f32>()
            .iter()
            .map(|&v| {
                if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            })
            .sum();
        self.sign_sum += signs;
        self.pred_count += real_pred.dim(0) as f32;
        self.calls += 1;

        if self.calls % self.update_every == 0 {
            let buffer = ctx.reduce_sum(&Array::from_slice(&[self.sign_sum, self.pred_count], &[2]))?;
            buffer.eval()?;
            let (signs, n_pred) = {
                let values = buffer.as_slice::<f32>();
                (values[0], values[1])
            };
            self.r_t_stat = signs / n_pred;
            let direction = if self.r_t_stat > self.target { 1.0 } else { -1.0 };
            self.p = (self.p + direction * n_pred / self.length as f32).clamp(0.0, 1.0);
            tracing::debug!(r_t = self.r_t_stat, p = self.p, "tuned augmentation probability");

            self.sign_sum = 0.0;
            self.pred_count = 0.0;
            self.calls = 0;
        }
        Ok(self.p)
    }
}
