//! Path-length regularization.

use mlx_rs::{error::Exception, Array};

use super::input_gradient;

/// Decay of the running mean path length.
pub const PATH_LENGTH_DECAY: f32 = 0.01;

/// Result of one path-length regularization pass.
#[derive(Debug, Clone)]
pub struct PathLengthOutput {
    /// `mean((path_lengths - path_mean)²)`.
    pub penalty: Array,
    /// Updated running mean, detached.
    pub mean_path_length: Array,
    /// Per-sample path lengths `[B]`.
    pub path_lengths: Array,
}

/// Penalize deviation of the latent-to-image Jacobian norm from its running mean.
///
/// `synthesize` maps `[B, n_latent, style_dim]` latents to `[B, C, H, W]`
/// images of shape `image_shape`. Projection noise is `N(0, 1) / sqrt(H * W)`.
pub fn path_length_penalty<F>(
    synthesize: F,
    latents: &Array,
    image_shape: &[i32],
    mean_path_length: f32,
    decay: f32,
) -> Result<PathLengthOutput, Exception>
where
    F: FnMut(&Array) -> Result<Array, Exception>,
{
    if image_shape.len() != 4 {
        return Err(Exception::custom(format!(
            "path length expects a 4D image shape, got {image_shape:?}"
        )));
    }
    let pixels = (image_shape[2] * image_shape[3]) as f32;
    let noise = mlx_rs::random::normal::<f32>(image_shape, None, None, None)?
        .divide(Array::from_f32(pixels.sqrt()))?;

    let mut synthesize = synthesize;
    let projected = move |w: &Array| -> Result<Array, Exception> {
        synthesize(w)?.multiply(&noise)?.sum(None)
    };
    let grad = input_gradient(projected, latents)?;

    let path_lengths = grad.square()?.sum_axis(2, None)?.mean_axis(1, None)?.sqrt()?;
    let running = Array::from_f32(mean_path_length);
    let path_mean = running.add(
        &path_lengths
            .mean(None)?
            .subtract(&running)?
            .multiply(Array::from_f32(decay))?,
    )?;
    let penalty = path_lengths.subtract(&path_mean)?.square()?.mean(None)?;

    Ok(PathLengthOutput {
        penalty,
        mean_path_length: mlx_rs::stop_gradient(&path_mean)?,
        path_lengths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_shapes_and_running_mean() {
        stylekd_models::seed_tensor_rng(21).unwrap();
        let latents = mlx_rs::random::normal::<f32>(&[2, 4, 3], None, None, None).unwrap();
        // Image = broadcast of the latent sum: a linear map with a known Jacobian.
        let out = path_length_penalty(
            |w: &Array| {
                let s = w.sum_axes(&[1, 2], Some(true))?.reshape(&[2, 1, 1, 1])?;
                mlx_rs::ops::broadcast_to(&s, &[2, 1, 2, 2])
            },
            &latents,
            &[2, 1, 2, 2],
            0.0,
            PATH_LENGTH_DECAY,
        )
        .unwrap();

        assert_eq!(out.path_lengths.shape(), &[2]);
        let lengths: Vec<f32> = out.path_lengths.as_slice().to_vec();
        let mean = (lengths[0] + lengths[1]) / 2.0;
        let expected = PATH_LENGTH_DECAY * mean;
        assert!((out.mean_path_length.item::<f32>() - expected).abs() < 1e-5);
        assert!(out.penalty.item::<f32>() >= 0.0);
    }

    #[test]
    fn test_rejects_non_image_shape() {
        let latents = Array::from_slice(&[0.0f32; 4], &[1, 2, 2]);
        let result = path_length_penalty(|w: &Array| Ok(w.clone()), &latents, &[1, 2], 0.0, 0.01);
        assert!(result.is_err());
    }
}
