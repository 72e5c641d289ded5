//! Network shape configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Shape of a style-based generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Output resolution (power of two, at least 4).
    pub size: usize,
    /// Latent and style dimension.
    pub style_dim: usize,
    /// Depth of the style-mapping network.
    pub n_mlp: usize,
    /// Channel multiplier for the high-resolution layers.
    pub channel_multiplier: usize,
    /// Maximum channel width.
    pub channel_base: usize,
    /// Learning-rate multiplier of the mapping network.
    #[serde(default = "default_lr_mlp")]
    pub lr_mlp: f32,
}

fn default_lr_mlp() -> f32 {
    0.01
}

impl GeneratorConfig {
    /// Create a configuration with the default mapping learning-rate multiplier.
    pub fn new(
        size: usize,
        style_dim: usize,
        n_mlp: usize,
        channel_multiplier: usize,
        channel_base: usize,
    ) -> Self {
        Self {
            size,
            style_dim,
            n_mlp,
            channel_multiplier,
            channel_base,
            lr_mlp: default_lr_mlp(),
        }
    }

    /// `log2(size)`.
    pub fn log_size(&self) -> usize {
        self.size.trailing_zeros() as usize
    }

    /// Number of per-layer latents consumed by synthesis.
    pub fn n_latent(&self) -> usize {
        self.log_size() * 2 - 2
    }

    /// Channel width at resolution `res`.
    pub fn channels(&self, res: usize) -> usize {
        channels_at(res, self.channel_base, self.channel_multiplier)
    }

    /// Reject shapes the synthesis network cannot build.
    pub fn validate(&self) -> Result<()> {
        validate_size(self.size)?;
        if self.style_dim == 0 || self.n_mlp == 0 {
            return Err(ModelError::Config(
                "style_dim and n_mlp must be > 0".to_string(),
            ));
        }
        if self.channel_base == 0 || self.channel_multiplier == 0 {
            return Err(ModelError::Config(
                "channel_base and channel_multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shape of a residual-free image discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Input resolution (power of two, at least 4).
    pub size: usize,
    /// Channel multiplier for the high-resolution layers.
    pub channel_multiplier: usize,
    /// Maximum channel width.
    pub channel_base: usize,
}

impl DiscriminatorConfig {
    /// Channel width at resolution `res`.
    pub fn channels(&self, res: usize) -> usize {
        channels_at(res, self.channel_base, self.channel_multiplier)
    }

    /// Reject shapes the network cannot build.
    pub fn validate(&self) -> Result<()> {
        validate_size(self.size)?;
        if self.channel_base == 0 || self.channel_multiplier == 0 {
            return Err(ModelError::Config(
                "channel_base and channel_multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// StyleGAN2 channel table: `base` up to 32px, then halving per octave
/// scaled by the multiplier.
fn channels_at(res: usize, base: usize, multiplier: usize) -> usize {
    let scaled = base * multiplier * 32 / res.max(1);
    scaled.clamp(1, base)
}

fn validate_size(size: usize) -> Result<()> {
    if size < 4 || !size.is_power_of_two() {
        return Err(ModelError::Config(format!(
            "size must be a power of two >= 4, got {size}"
        )));
    }
    Ok(())
}
