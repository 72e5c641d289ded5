//! Logistic GAN losses.

use mlx_rs::{error::Exception, nn, Array};

/// Discriminator loss with the mean scores it was computed from.
#[derive(Debug, Clone)]
pub struct DiscriminatorLossOutput {
    /// `mean(softplus(-real)) + mean(softplus(fake))`.
    pub total: Array,
    /// Mean logit on real images.
    pub real_score: Array,
    /// Mean logit on generated images.
    pub fake_score: Array,
}

fn negate(x: &Array) -> Result<Array, Exception> {
    x.multiply(Array::from_f32(-1.0))
}

/// `mean(softplus(-real_pred)) + mean(softplus(fake_pred))`.
pub fn d_logistic_loss(real_pred: &Array, fake_pred: &Array) -> Result<Array, Exception> {
    let real_loss = nn::softplus(&negate(real_pred)?)?.mean(None)?;
    let fake_loss = nn::softplus(fake_pred)?.mean(None)?;
    real_loss.add(&fake_loss)
}

/// [`d_logistic_loss`] together with the mean real and fake scores.
pub fn discriminator_loss(
    real_pred: &Array,
    fake_pred: &Array,
) -> Result<DiscriminatorLossOutput, Exception> {
    Ok(DiscriminatorLossOutput {
        total: d_logistic_loss(real_pred, fake_pred)?,
        real_score: real_pred.mean(None)?,
        fake_score: fake_pred.mean(None)?,
    })
}

/// `mean(softplus(-fake_pred))`.
pub fn g_nonsaturating_loss(fake_pred: &Array) -> Result<Array, Exception> {
    nn::softplus(&negate(fake_pred)?)?.mean(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_d_loss_non_negative() {
        for (r, f) in [(5.0f32, -5.0f32), (-3.0, 3.0), (0.0, 0.0)] {
            let real = Array::from_slice(&[r, r], &[2, 1]);
            let fake = Array::from_slice(&[f, f], &[2, 1]);
            let loss = d_logistic_loss(&real, &fake).unwrap().item::<f32>();
            assert!(loss >= 0.0);
        }
    }

    #[test]
    fn test_d_loss_at_zero_logits() {
        let zeros = Array::from_slice(&[0.0f32; 4], &[4, 1]);
        let loss = d_logistic_loss(&zeros, &zeros).unwrap().item::<f32>();
        assert!((loss - 2.0 * std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_d_loss_is_not_symmetric() {
        let a = Array::from_slice(&[2.0f32], &[1, 1]);
        let b = Array::from_slice(&[-1.0f32], &[1, 1]);
        let ab = d_logistic_loss(&a, &b).unwrap().item::<f32>();
        let ba = d_logistic_loss(&b, &a).unwrap().item::<f32>();
        assert!((ab - ba).abs() > 1e-3);
    }

    #[test]
    fn test_scores_are_means() {
        let real = Array::from_slice(&[1.0f32, 3.0], &[2, 1]);
        let fake = Array::from_slice(&[-2.0f32, 0.0], &[2, 1]);
        let out = discriminator_loss(&real, &fake).unwrap();
        assert!((out.real_score.item::<f32>() - 2.0).abs() < 1e-6);
        assert!((out.fake_score.item::<f32>() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_g_loss_decreases_with_confident_fakes() {
        let weak = Array::from_slice(&[-4.0f32], &[1, 1]);
        let strong = Array::from_slice(&[4.0f32], &[1, 1]);
        let lw = g_nonsaturating_loss(&weak).unwrap().item::<f32>();
        let ls = g_nonsaturating_loss(&strong).unwrap().item::<f32>();
        assert!(ls < lw);
    }
}
