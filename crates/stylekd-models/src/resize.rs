//! Bilinear resampling of NCHW image batches.
//!
//! Resampling is expressed as two interpolation matrices, `Rh @ x @ Rwᵀ`, so
//! it stays differentiable and runs as plain matmuls. Sample positions follow
//! the half-pixel convention: `src = (dst + 0.5) * in / out - 0.5`, clamped
//! at zero.

use mlx_rs::{error::Exception, Array};

/// Row-stochastic `[out, in]` interpolation matrix along one axis.
pub fn interpolation_matrix(in_len: usize, out_len: usize) -> Array {
    let mut weights = vec![0.0f32; out_len * in_len];
    let scale = in_len as f32 / out_len as f32;
    for dst in 0..out_len {
        let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_len - 1);
        let i1 = (i0 + 1).min(in_len - 1);
        let frac = src - i0 as f32;
        weights[dst * in_len + i0] += 1.0 - frac;
        weights[dst * in_len + i1] += frac;
    }
    Array::from_slice(&weights, &[out_len as i32, in_len as i32])
}

/// Resize `x` (`[B, C, H, W]`) to `[B, C, out_h, out_w]`.
pub fn resize_bilinear(x: &Array, out_h: usize, out_w: usize) -> Result<Array, Exception> {
    let shape = x.shape();
    if shape.len() != 4 {
        return Err(Exception::custom(format!(
            "resize_bilinear expects a 4D NCHW array, got shape {shape:?}"
        )));
    }
    let (h, w) = (shape[2] as usize, shape[3] as usize);
    if h == out_h && w == out_w {
        return Ok(x.clone());
    }

    let rh = interpolation_matrix(h, out_h);
    let rw_t = interpolation_matrix(w, out_w).transpose_axes(&[1, 0])?;
    rh.matmul(&x.matmul(&rw_t)?)
}

/// 2x bilinear upsampling.
pub fn upsample2x(x: &Array) -> Result<Array, Exception> {
    let shape = x.shape();
    resize_bilinear(x, shape[2] as usize * 2, shape[3] as usize * 2)
}

/// 2x2 average pooling.
pub fn downsample2x(x: &Array) -> Result<Array, Exception> {
    let shape = x.shape();
    let (b, c, h, w) = (shape[0], shape[1], shape[2], shape[3]);
    x.reshape(&[b, c, h / 2, 2, w / 2, 2])?
        .mean_axes(&[3, 5], None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_rows_sum_to_one() {
        for (inp, out) in [(8, 4), (4, 8), (5, 3), (1, 4)] {
            let m = interpolation_matrix(inp, out);
            let sums = m.sum_axis(-1, None).unwrap();
            sums.eval().unwrap();
            for s in sums.as_slice::<f32>() {
                assert!((s - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_downscale_by_two_averages_pairs() {
        // Half-pixel bilinear at exactly 2x reduction averages neighbours.
        let x = Array::from_slice(&[1.0f32, 3.0, 5.0, 7.0], &[1, 1, 1, 4]);
        let y = resize_bilinear(&x, 1, 2).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 2]);
        y.eval().unwrap();
        let v = y.as_slice::<f32>().to_vec();
        assert!((v[0] - 2.0).abs() < 1e-5);
        assert!((v[1] - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_upsample_preserves_constant() {
        let x = mlx_rs::ops::ones::<f32>(&[2, 3, 4, 4]).unwrap();
        let y = upsample2x(&x).unwrap();
        assert_eq!(y.shape(), &[2, 3, 8, 8]);
        let mean = y.mean(None).unwrap().item::<f32>();
        assert!((mean - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_same_size_is_identity() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let y = resize_bilinear(&x, 2, 2).unwrap();
        assert_eq!(y.as_slice::<f32>(), x.as_slice::<f32>());
    }

    #[test]
    fn test_downsample2x_shape() {
        let x = mlx_rs::ops::ones::<f32>(&[1, 2, 8, 8]).unwrap();
        assert_eq!(downsample2x(&x).unwrap().shape(), &[1, 2, 4, 4]);
    }
}
