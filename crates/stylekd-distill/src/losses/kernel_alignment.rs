//! Kernel alignment between teacher and student feature maps.
//!
//! Each map is flattened per sample and turned into a `B x B` Gram matrix;
//! the alignment is the cosine similarity of the two Gram matrices. It is
//! invariant to channel count and spatial size, so maps of different widths
//! can be compared directly.

use mlx_rs::Array;

use crate::{DistillError, Result};

/// `<Gx, Gy>_F / sqrt(|Gx|²_F |Gy|²_F)` with `G = flat(X) flat(X)ᵀ`.
///
/// The batch dimensions of `x` and `y` must agree.
pub fn kernel_alignment(x: &Array, y: &Array) -> Result<Array> {
    if x.dim(0) != y.dim(0) {
        return Err(DistillError::ShapeMismatch {
            teacher: y.shape().to_vec(),
            student: x.shape().to_vec(),
        });
    }
    let batch = x.dim(0);
    let xf = x.reshape(&[batch, -1])?;
    let yf = y.reshape(&[batch, -1])?;
    let gx = xf.matmul(&xf.transpose_axes(&[1, 0])?)?;
    let gy = yf.matmul(&yf.transpose_axes(&[1, 0])?)?;

    let inner = gx.multiply(&gy)?.sum(None)?;
    let norms = gx.square()?.sum(None)?.multiply(&gy.square()?.sum(None)?)?;
    Ok(inner.divide(&norms.sqrt()?)?)
}

/// Sum of [`kernel_alignment`] over paired student and teacher maps.
///
/// Maps are paired in order; surplus maps on either side are ignored.
pub fn feature_alignment(student_maps: &[Array], teacher_maps: &[Array]) -> Result<Array> {
    let mut total = Array::from_f32(0.0);
    for (s, t) in student_maps.iter().zip(teacher_maps) {
        total = total.add(&kernel_alignment(s, t)?)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_self_alignment_is_one() {
        stylekd_models::seed_tensor_rng(31).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[4, 8, 2, 2], None, None, None).unwrap();
        let ka = kernel_alignment(&x, &x).unwrap().item::<f32>();
        assert!((ka - 1.0).abs() < 1e-4);
    }

    #[test]
    #[serial]
    fn test_alignment_across_widths() {
        stylekd_models::seed_tensor_rng(32).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[3, 16, 4, 4], None, None, None).unwrap();
        let y = mlx_rs::random::normal::<f32>(&[3, 4, 8, 8], None, None, None).unwrap();
        let ka = kernel_alignment(&x, &y).unwrap().item::<f32>();
        assert!(ka > 0.0 && ka <= 1.0 + 1e-5);
    }

    #[test]
    fn test_scale_invariant() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0, -1.0], &[2, 2]);
        let y = x.multiply(Array::from_f32(7.5)).unwrap();
        let ka = kernel_alignment(&x, &y).unwrap().item::<f32>();
        assert!((ka - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_batch_mismatch_is_an_error() {
        let x = Array::from_slice(&[0.0f32; 6], &[2, 3]);
        let y = Array::from_slice(&[0.0f32; 9], &[3, 3]);
        let err = kernel_alignment(&x, &y).unwrap_err();
        assert!(matches!(err, DistillError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_feature_alignment_sums_pairs() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0, -1.0], &[2, 2]);
        let total = feature_alignment(&[x.clone(), x.clone()], &[x.clone(), x.clone(), x])
            .unwrap()
            .item::<f32>();
        assert!((total - 2.0).abs() < 1e-5);
    }
}
