//! Exponential moving average of generator weights.

use mlx_rs::{module::ModuleParameters, Array};

use crate::{Result, TrainerError};

/// Shadow-generator decay: half-life of 10k images at 32 images per step.
pub fn generator_ema_decay() -> f32 {
    0.5f32.powf(32.0 / 10_000.0)
}

/// `target = target * decay + source * (1 - decay)` for every shared name.
///
/// `decay = 0` copies `source`; `decay = 1` leaves `target` untouched.
/// Results are detached and evaluated.
pub fn accumulate<M: ModuleParameters>(target: &mut M, source: &M, decay: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&decay) {
        return Err(TrainerError::InvalidArgument(format!(
            "EMA decay must be in [0, 1], got {decay}"
        )));
    }
    let source = source.parameters().flatten();
    let keep = Array::from_f32(decay);
    let take = Array::from_f32(1.0 - decay);

    for (key, param) in target.parameters_mut().flatten() {
        let Some(src) = source.get(&key) else {
            continue;
        };
        let blended = param.multiply(&keep)?.add(&src.multiply(&take)?)?;
        let blended = mlx_rs::stop_gradient(&blended)?;
        blended.eval()?;
        *param = blended;
    }
    Ok(())
}
