//! Losses for compressing a style-based GAN by distillation.
//!
//! - **Adversarial**: logistic discriminator loss, non-saturating generator loss
//! - **Regularizers**: R1 gradient penalty, path-length regularization
//! - **Distillation**: kernel alignment between teacher and student feature
//!   maps, LPIPS-form perceptual distance between images
//!
//! Regularizers differentiate a caller-supplied closure with respect to its
//! input, so they compose with any network and with augmentation applied
//! inside the closure.
//!
//! ```rust,ignore
//! use stylekd_distill::{g_nonsaturating_loss, feature_alignment};
//!
//! let adv = g_nonsaturating_loss(&fake_pred)?;
//! let ka = feature_alignment(&student_maps, &teacher_maps)?;
//! let g_loss = adv.subtract(&ka)?;
//! ```

#![warn(missing_docs)]

mod error;
pub mod losses;
pub mod perceptual;

pub use error::{DistillError, Result};
pub use losses::{
    d_logistic_loss, discriminator_loss, feature_alignment, g_nonsaturating_loss,
    input_gradient, kernel_alignment, path_length_penalty, r1_penalty, DiscriminatorLossOutput,
    PathLengthOutput, PATH_LENGTH_DECAY,
};
pub use perceptual::{FeatureExtractor, LaplacianPyramid, PerceptualLoss, VggFeatures};
