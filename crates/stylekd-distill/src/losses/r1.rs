//! R1 gradient penalty.

use mlx_rs::{error::Exception, Array};

use super::input_gradient;

/// Mean over the batch of `|∇ₓ sum(score(x))|²` at the real images.
///
/// `score` maps images to discriminator logits and may apply augmentation;
/// the gradient is taken with respect to the images it receives.
pub fn r1_penalty<F>(score: F, real_img: &Array) -> Result<Array, Exception>
where
    F: FnMut(&Array) -> Result<Array, Exception>,
{
    let mut score = score;
    let summed = move |x: &Array| -> Result<Array, Exception> { score(x)?.sum(None) };
    let grad_real = input_gradient(summed, real_img)?;
    let batch = grad_real.dim(0);
    grad_real
        .square()?
        .reshape(&[batch, -1])?
        .sum_axis(1, None)?
        .mean(None)
}
