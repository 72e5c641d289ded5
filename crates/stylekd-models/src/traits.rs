//! Contracts the training loop relies on.
//!
//! The loop never looks inside a network: it maps noise to per-layer
//! latents, synthesizes images from latents (optionally with intermediate
//! feature maps), scores images, and walks parameters through
//! [`ModuleParameters`].

use mlx_rs::{error::Exception, module::ModuleParameters, Array};

/// Output of a generator forward pass.
#[derive(Debug, Clone)]
pub struct GeneratorOutput {
    /// Images `[B, 3, H, W]` in roughly `[-1, 1]`.
    pub image: Array,
    /// Per-layer latents `[B, n_latent, style_dim]` the images were synthesized from.
    pub latents: Array,
    /// Intermediate feature maps `[B, C, H, W]`, coarse to fine. Empty unless requested.
    pub f_maps: Vec<Array>,
}

/// A style-based image generator.
pub trait ImageGenerator: ModuleParameters {
    /// Output resolution.
    fn resolution(&self) -> usize;

    /// Latent (noise and style) dimension.
    fn style_dim(&self) -> usize;

    /// Number of per-layer latents synthesis consumes.
    fn n_latent(&self) -> usize;

    /// Map one or two `[B, style_dim]` noise batches to `[B, n_latent, style_dim]`.
    ///
    /// With two batches the latents cross over at a random layer.
    fn map_styles(&self, noises: &[Array]) -> Result<Array, Exception>;

    /// Synthesize images from per-layer latents.
    fn synthesize(&self, latents: &Array, return_f_maps: bool) -> Result<GeneratorOutput, Exception>;

    /// Full forward pass from noise.
    fn generate(&self, noises: &[Array], return_f_maps: bool) -> Result<GeneratorOutput, Exception> {
        let latents = self.map_styles(noises)?;
        self.synthesize(&latents, return_f_maps)
    }
}

/// An image discriminator producing one logit per sample.
pub trait ImageDiscriminator: ModuleParameters {
    /// Score `[B, 3, H, W]` images, returning `[B, 1]` logits.
    fn forward(&self, images: &Array) -> Result<Array, Exception>;
}
