//! Differentiable stochastic augmentation.
//!
//! Every transform is applied per sample with probability `p` and is built
//! from array ops only, so gradients flow back to the input images (needed
//! when R1 and the generator loss see augmented batches).

use mlx_rs::{error::Exception, ops, random, Array, Dtype};

/// Per-sample transform parameters drawn for one call.
#[derive(Debug, Clone)]
pub struct AugmentParams {
    /// `1.0` where the sample was mirrored, `[B]`.
    pub flip: Array,
    /// Additive brightness offset, `[B]`.
    pub brightness: Array,
    /// Multiplicative contrast factor, `[B]`.
    pub contrast: Array,
}

/// Augmentation applied to `[B, 3, H, W]` batches.
pub trait Augment {
    /// Augment each sample with probability `p`.
    fn augment(&self, images: &Array, p: f32) -> Result<(Array, AugmentParams), Exception>;
}

/// Horizontal flip, brightness shift and contrast scaling.
#[derive(Debug, Clone, Copy)]
pub struct AugmentPipeline {
    /// Enable horizontal flips.
    pub xflip: bool,
    /// Standard deviation of the brightness offset.
    pub brightness_std: f32,
    /// Standard deviation of `log2` of the contrast factor.
    pub contrast_std: f32,
}

impl Default for AugmentPipeline {
    fn default() -> Self {
        Self {
            xflip: true,
            brightness_std: 0.2,
            contrast_std: 0.5,
        }
    }
}

/// `[B]` mask with `1.0` where a uniform draw falls below `p`.
fn gate(batch: i32, p: f32) -> Result<Array, Exception> {
    let u = random::uniform::<_, f32>(0.0, 1.0, &[batch], None)?;
    u.lt(&Array::from_f32(p))?.as_dtype(Dtype::Float32)
}

/// `[W, W]` anti-diagonal permutation; `x @ J` mirrors the last axis.
fn reversal_matrix(width: i32) -> Array {
    let w = width as usize;
    let mut data = vec![0.0f32; w * w];
    for i in 0..w {
        data[i * w + (w - 1 - i)] = 1.0;
    }
    Array::from_slice(&data, &[width, width])
}

impl Augment for AugmentPipeline {
    fn augment(&self, images: &Array, p: f32) -> Result<(Array, AugmentParams), Exception> {
        let shape = images.shape();
        if shape.len() != 4 {
            return Err(Exception::custom(format!(
                "augment expects [B, C, H, W], got {shape:?}"
            )));
        }
        let (batch, width) = (shape[0], shape[3]);
        let per_sample = |v: &Array| v.reshape(&[batch, 1, 1, 1]);

        if p <= 0.0 {
            let identity = AugmentParams {
                flip: ops::zeros::<f32>(&[batch])?,
                brightness: ops::zeros::<f32>(&[batch])?,
                contrast: ops::ones::<f32>(&[batch])?,
            };
            return Ok((images.clone(), identity));
        }

        let mut x = images.clone();

        let flip = if self.xflip {
            gate(batch, p)?
        } else {
            ops::zeros::<f32>(&[batch])?
        };
        if self.xflip {
            let mirrored = x.matmul(&reversal_matrix(width))?;
            let m = per_sample(&flip)?;
            let keep = Array::from_f32(1.0).subtract(&m)?;
            x = mirrored.multiply(&m)?.add(&x.multiply(&keep)?)?;
        }

        let brightness = random::normal::<f32>(&[batch], None, None, None)?
            .multiply(Array::from_f32(self.brightness_std))?
            .multiply(&gate(batch, p)?)?;
        x = x.add(&per_sample(&brightness)?)?;

        let log2_c = random::normal::<f32>(&[batch], None, None, None)?
            .multiply(Array::from_f32(self.contrast_std))?
            .multiply(&gate(batch, p)?)?;
        let contrast = ops::exp(&log2_c.multiply(Array::from_f32(std::f32::consts::LN_2))?)?;
        let mean = x.mean_axes(&[1, 2, 3], Some(true))?;
        x = x
            .subtract(&mean)?
            .multiply(&per_sample(&contrast)?)?
            .add(&mean)?;

        Ok((
            x,
            AugmentParams {
                flip,
                brightness,
                contrast,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        a.subtract(b).unwrap().abs().unwrap().max(None).unwrap().item::<f32>()
    }

    #[test]
    #[serial]
    fn test_zero_probability_is_identity() {
        random::seed(1).unwrap();
        let x = random::normal::<f32>(&[2, 3, 4, 4], None, None, None).unwrap();
        let (y, params) = AugmentPipeline::default().augment(&x, 0.0).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-7);
        assert_eq!(params.contrast.sum(None).unwrap().item::<f32>(), 2.0);
    }

    #[test]
    #[serial]
    fn test_full_probability_flips_every_sample() {
        random::seed(2).unwrap();
        let x = random::normal::<f32>(&[3, 3, 4, 4], None, None, None).unwrap();
        let pipeline = AugmentPipeline {
            xflip: true,
            brightness_std: 0.0,
            contrast_std: 0.0,
        };
        let (y, params) = pipeline.augment(&x, 1.0).unwrap();
        assert_eq!(params.flip.sum(None).unwrap().item::<f32>(), 3.0);
        let twice = y.matmul(&reversal_matrix(4)).unwrap();
        assert!(max_abs_diff(&x, &twice) < 1e-6);
        assert!(max_abs_diff(&x, &y) > 1e-3);
    }

    #[test]
    #[serial]
    fn test_gradient_flows_through_augment() {
        random::seed(3).unwrap();
        let x = random::normal::<f32>(&[2, 3, 4, 4], None, None, None).unwrap();
        let pipeline = AugmentPipeline::default();
        let loss = |input: &Array| -> Result<Array, Exception> {
            let (y, _) = pipeline.augment(input, 1.0)?;
            y.square()?.sum(None)
        };
        let mut g = mlx_rs::transforms::grad(loss);
        let grads = g(&x).unwrap();
        assert_eq!(grads.shape(), x.shape());
        assert!(grads.abs().unwrap().sum(None).unwrap().item::<f32>() > 0.0);
    }

    #[test]
    fn test_reversal_matrix_mirrors_rows() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0], &[1, 3]);
        let y = x.matmul(&reversal_matrix(3)).unwrap();
        assert_eq!(y.as_slice::<f32>(), &[3.0, 2.0, 1.0]);
    }
}
