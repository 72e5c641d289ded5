//! Adam with lazy-regularization scaling.
//!
//! When a regularizer runs only every `reg_every` steps, the optimizer that
//! also applies the main loss every step is compensated with
//! `ratio = reg_every / (reg_every + 1)`:
//!
//! ```text
//! lr    = lr * ratio
//! betas = (0 ** ratio, 0.99 ** ratio)
//! ```
//!
//! Moments are kept per flattened parameter name so they can be written to
//! and restored from a checkpoint alongside the weights.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::{
    module::{FlattenedModuleParam, ModuleParameters},
    Array,
};

use stylekd_core::reg_ratio;

use crate::{Result, TrainerError};

/// Adam optimizer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// Learning rate.
    pub lr: f32,
    /// First moment decay.
    pub beta1: f32,
    /// Second moment decay.
    pub beta2: f32,
    /// Denominator epsilon.
    pub eps: f32,
}

impl AdamConfig {
    /// Scaled configuration for a network regularized every `reg_every` steps.
    pub fn lazy_regularized(lr: f32, reg_every: usize) -> Self {
        let ratio = reg_ratio(reg_every);
        Self {
            lr: lr * ratio,
            beta1: 0.0f32.powf(ratio),
            beta2: 0.99f32.powf(ratio),
            eps: 1e-8,
        }
    }
}

/// Per-parameter first and second moments.
#[derive(Debug, Clone)]
pub struct AdamState {
    /// First moment.
    pub m: Array,
    /// Second moment.
    pub v: Array,
}

/// Bias-corrected Adam over a [`ModuleParameters`] network.
#[derive(Debug, Clone)]
pub struct RegularizedAdam {
    config: AdamConfig,
    step: u64,
    state: HashMap<Rc<str>, AdamState>,
}

impl RegularizedAdam {
    /// Create an optimizer with empty moments.
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            step: 0,
            state: HashMap::new(),
        }
    }

    /// Shorthand for [`AdamConfig::lazy_regularized`].
    pub fn lazy_regularized(lr: f32, reg_every: usize) -> Self {
        Self::new(AdamConfig::lazy_regularized(lr, reg_every))
    }

    /// Configuration in use.
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of updates applied.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Moments of one parameter, if it has been updated.
    pub fn moments(&self, key: &str) -> Option<&AdamState> {
        self.state.get(key)
    }

    /// Apply one update to every parameter of `model` that has a gradient.
    pub fn update<M: ModuleParameters>(
        &mut self,
        model: &mut M,
        grads: FlattenedModuleParam,
    ) -> Result<()> {
        self.step += 1;
        let t = self.step.min(i32::MAX as u64) as i32;
        let c = self.config;
        let bias1 = Array::from_f32(1.0 - c.beta1.powi(t));
        let bias2 = Array::from_f32(1.0 - c.beta2.powi(t));
        let beta1 = Array::from_f32(c.beta1);
        let beta2 = Array::from_f32(c.beta2);
        let one_minus_beta1 = Array::from_f32(1.0 - c.beta1);
        let one_minus_beta2 = Array::from_f32(1.0 - c.beta2);
        let lr = Array::from_f32(c.lr);
        let eps = Array::from_f32(c.eps);

        let mut params = model.parameters_mut().flatten();
        for (key, grad) in grads {
            let Some(param) = params.get_mut(&key) else {
                continue;
            };
            let (m, v) = match self.state.get(&key) {
                Some(s) => (s.m.clone(), s.v.clone()),
                None => (
                    mlx_rs::ops::zeros::<f32>(grad.shape())?,
                    mlx_rs::ops::zeros::<f32>(grad.shape())?,
                ),
            };

            let m = m.multiply(&beta1)?.add(&grad.multiply(&one_minus_beta1)?)?;
            let v = v
                .multiply(&beta2)?
                .add(&grad.square()?.multiply(&one_minus_beta2)?)?;
            let m_hat = m.divide(&bias1)?;
            let v_hat = v.divide(&bias2)?;
            let delta = m_hat.divide(&v_hat.sqrt()?.add(&eps)?)?.multiply(&lr)?;
            let updated = param.subtract(&delta)?;

            m.eval()?;
            v.eval()?;
            updated.eval()?;
            **param = updated;
            self.state.insert(key, AdamState { m, v });
        }
        Ok(())
    }

    /// Export moments as `{prefix}{param}.m` / `.v` plus `{prefix}step`.
    pub fn state_dict(&self, prefix: &str) -> HashMap<String, Array> {
        let mut out = HashMap::with_capacity(self.state.len() * 2 + 1);
        for (key, s) in &self.state {
            out.insert(format!("{prefix}{key}.m"), s.m.clone());
            out.insert(format!("{prefix}{key}.v"), s.v.clone());
        }
        out.insert(format!("{prefix}step"), Array::from_f32(self.step as f32));
        out
    }

    /// Restore moments written by [`state_dict`](Self::state_dict).
    ///
    /// Both moments must be present for a parameter; a lone `.m` or `.v` is
    /// an error. Existing state is replaced.
    pub fn load_state_dict(&mut self, arrays: &HashMap<String, Array>, prefix: &str) -> Result<()> {
        let mut state = HashMap::new();
        for (name, m) in arrays {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            let Some(param) = rest.strip_suffix(".m") else {
                continue;
            };
            let v_key = format!("{prefix}{param}.v");
            let v = arrays.get(&v_key).ok_or_else(|| {
                TrainerError::Checkpoint(format!("missing second moment {v_key}"))
            })?;
            state.insert(
                Rc::from(param),
                AdamState {
                    m: m.clone(),
                    v: v.clone(),
                },
            );
        }

        let orphan = arrays.keys().find(|name| {
            name.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".v"))
                .is_some_and(|param| !state.contains_key(param))
        });
        if let Some(orphan) = orphan {
            return Err(TrainerError::Checkpoint(format!(
                "second moment {orphan} has no first moment"
            )));
        }

        self.step = match arrays.get(&format!("{prefix}step")) {
            Some(step) => step.item::<f32>() as u64,
            None => 0,
        };
        self.state = state;
        tracing::debug!(prefix, params = self.state.len(), step = self.step, "restored optimizer state");
        Ok(())
    }
}
