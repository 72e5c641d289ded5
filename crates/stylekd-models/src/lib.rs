//! Generator and discriminator contracts for StyleKD, with reference networks.
//!
//! The training loop only depends on [`ImageGenerator`] and
//! [`ImageDiscriminator`]. The reference [`StyleGenerator`] and
//! [`StyleDiscriminator`] follow the StyleGAN2 layout (mapping network,
//! modulated convolutions, skip RGB heads, minibatch stddev) closely enough
//! that teacher and student checkpoints share parameter names.
//!
//! ```ignore
//! use stylekd_models::{GeneratorConfig, ImageGenerator, StyleGenerator};
//!
//! let g = StyleGenerator::new(GeneratorConfig::new(256, 512, 8, 1, 512))?;
//! let out = g.generate(&[noise], true)?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod layers;
pub mod resize;
pub mod traits;
pub mod weights;

pub use config::{DiscriminatorConfig, GeneratorConfig};
pub use discriminator::StyleDiscriminator;
pub use error::{ModelError, Result};
pub use generator::StyleGenerator;
pub use resize::resize_bilinear;
pub use traits::{GeneratorOutput, ImageDiscriminator, ImageGenerator};
pub use weights::{
    inherit_style, load_weights, named_weights, read_safetensors, write_safetensors, LoadReport,
    StyleKeyFilter,
};

/// Seed MLX's global random generator.
pub fn seed_tensor_rng(seed: u64) -> std::result::Result<(), mlx_rs::error::Exception> {
    mlx_rs::random::seed(seed)
}
