//! Loss primitives.

mod adversarial;
mod kernel_alignment;
mod path_length;
mod r1;

pub use adversarial::{d_logistic_loss, discriminator_loss, g_nonsaturating_loss, DiscriminatorLossOutput};
pub use kernel_alignment::{feature_alignment, kernel_alignment};
pub use path_length::{path_length_penalty, PathLengthOutput, PATH_LENGTH_DECAY};
pub use r1::r1_penalty;

use mlx_rs::{error::Exception, Array};

/// Gradient of a scalar-valued `f` with respect to its input at `x`.
///
/// The returned gradient stays differentiable, so it can feed a loss that is
/// itself differentiated with respect to network parameters.
pub fn input_gradient<F>(f: F, x: &Array) -> Result<Array, Exception>
where
    F: FnMut(&Array) -> Result<Array, Exception>,
{
    let mut grad_fn = mlx_rs::transforms::grad(f);
    grad_fn(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_gradient_of_square_sum() {
        let x = Array::from_slice(&[1.0f32, -2.0, 3.0], &[3]);
        let g = input_gradient(|x: &Array| x.square()?.sum(None), &x).unwrap();
        let v: Vec<f32> = g.as_slice().to_vec();
        assert_eq!(v, vec![2.0, -4.0, 6.0]);
    }
}
