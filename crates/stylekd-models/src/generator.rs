//! Reference style-based generator.
//!
//! A mapping network (`style.*` parameters) turns noise into style vectors;
//! a synthesis network grows a learned 4x4 constant to the output resolution
//! with two modulated convolutions per octave and accumulates RGB through
//! skip connections.

use mlx_rs::{
    error::Exception,
    macros::ModuleParameters,
    module::Param,
    ops::{self, indexing::IndexOp},
    Array, Dtype,
};

use crate::config::GeneratorConfig;
use crate::error::Result;
use crate::layers::{pixel_norm, EqualLinear, StyledConv, ToRgb};
use crate::traits::{GeneratorOutput, ImageGenerator};

/// StyleGAN2-shaped generator.
#[derive(Debug, ModuleParameters)]
pub struct StyleGenerator {
    /// Shape configuration (not a parameter).
    pub config: GeneratorConfig,
    /// Style-mapping network.
    #[param]
    pub style: Vec<EqualLinear>,
    /// Learned 4x4 input `[1, C, 4, 4]`.
    #[param]
    pub const_input: Param<Array>,
    /// 4x4 convolution.
    #[param]
    pub conv1: StyledConv,
    /// 4x4 RGB head.
    #[param]
    pub to_rgb1: ToRgb,
    /// Two convolutions per octave above 4x4; the first of each pair upsamples.
    #[param]
    pub convs: Vec<StyledConv>,
    /// One RGB head per octave above 4x4.
    #[param]
    pub to_rgbs: Vec<ToRgb>,
}

impl StyleGenerator {
    /// Build a randomly initialized generator.
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let style_dim = config.style_dim;

        let style = (0..config.n_mlp)
            .map(|_| EqualLinear::new(style_dim, style_dim, 0.0, config.lr_mlp, true))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let c4 = config.channels(4);
        let const_input = mlx_rs::random::normal::<f32>(&[1, c4 as i32, 4, 4], None, None, None)?;
        let conv1 = StyledConv::new(c4, c4, 3, style_dim, false)?;
        let to_rgb1 = ToRgb::new(c4, style_dim)?;

        let mut convs = Vec::new();
        let mut to_rgbs = Vec::new();
        let mut in_channels = c4;
        for level in 3..=config.log_size() {
            let out_channels = config.channels(1 << level);
            convs.push(StyledConv::new(in_channels, out_channels, 3, style_dim, true)?);
            convs.push(StyledConv::new(out_channels, out_channels, 3, style_dim, false)?);
            to_rgbs.push(ToRgb::new(out_channels, style_dim)?);
            in_channels = out_channels;
        }

        tracing::debug!(
            size = config.size,
            n_latent = config.n_latent(),
            layers = convs.len() + 1,
            "built style generator"
        );

        Ok(Self {
            config,
            style,
            const_input: Param::new(const_input),
            conv1,
            to_rgb1,
            convs,
            to_rgbs,
        })
    }

    /// Map `[B, style_dim]` noise to `[B, style_dim]` style vectors.
    pub fn mapping(&self, noise: &Array) -> std::result::Result<Array, Exception> {
        let mut w = pixel_norm(noise)?;
        for layer in &self.style {
            w = layer.forward(&w)?;
        }
        Ok(w)
    }

    /// Cross two latent batches: layers below a random index take `w1`.
    fn mix(&self, w1: &Array, w2: &Array) -> std::result::Result<Array, Exception> {
        let n_latent = self.config.n_latent() as i32;
        // Crossover index uniform in [1, n_latent - 1].
        let u = mlx_rs::random::uniform::<_, f32>(0.0, 1.0, &[1], None)?;
        let index = ops::floor(&u.multiply(Array::from_f32((n_latent - 1) as f32))?)?
            .add(Array::from_f32(1.0))?;
        let layers = ops::arange::<_, f32>(0.0, n_latent as f32, None)?;
        let take_first = layers
            .lt(&index)?
            .as_dtype(Dtype::Float32)?
            .reshape(&[1, n_latent, 1])?;
        let take_second = Array::from_f32(1.0).subtract(&take_first)?;

        let a = self.broadcast_latent(w1)?.multiply(&take_first)?;
        let b = self.broadcast_latent(w2)?.multiply(&take_second)?;
        a.add(&b)
    }

    fn broadcast_latent(&self, w: &Array) -> std::result::Result<Array, Exception> {
        let batch = w.dim(0);
        let dim = w.dim(1);
        let n_latent = self.config.n_latent() as i32;
        ops::broadcast_to(&w.reshape(&[batch, 1, dim])?, &[batch, n_latent, dim])
    }
}

impl ImageGenerator for StyleGenerator {
    fn resolution(&self) -> usize {
        self.config.size
    }

    fn style_dim(&self) -> usize {
        self.config.style_dim
    }

    fn n_latent(&self) -> usize {
        self.config.n_latent()
    }

    fn map_styles(&self, noises: &[Array]) -> std::result::Result<Array, Exception> {
        match noises {
            [z] => self.broadcast_latent(&self.mapping(z)?),
            [z1, z2] => self.mix(&self.mapping(z1)?, &self.mapping(z2)?),
            _ => Err(Exception::custom(format!(
                "expected one or two noise batches, got {}",
                noises.len()
            ))),
        }
    }

    fn synthesize(
        &self,
        latents: &Array,
        return_f_maps: bool,
    ) -> std::result::Result<GeneratorOutput, Exception> {
        let n_latent = self.config.n_latent() as i32;
        if latents.ndim() != 3 || latents.dim(1) != n_latent {
            return Err(Exception::custom(format!(
                "expected latents [B, {n_latent}, D], got {:?}",
                latents.shape()
            )));
        }
        let latent = |i: i32| latents.index((.., i, ..));
        let batch = latents.dim(0);

        let c4 = self.const_input.dim(1);
        let mut out = ops::broadcast_to(&*self.const_input, &[batch, c4, 4, 4])?;
        out = self.conv1.forward(&out, &latent(0))?;
        let mut f_maps = Vec::new();
        if return_f_maps {
            f_maps.push(out.clone());
        }
        let mut skip = self.to_rgb1.forward(&out, &latent(1), None)?;

        let mut i = 1;
        for (pair, to_rgb) in self.convs.chunks(2).zip(&self.to_rgbs) {
            out = pair[0].forward(&out, &latent(i))?;
            out = pair[1].forward(&out, &latent(i + 1))?;
            skip = to_rgb.forward(&out, &latent(i + 2), Some(&skip))?;
            if return_f_maps {
                f_maps.push(out.clone());
            }
            i += 2;
        }

        Ok(GeneratorOutput {
            image: skip,
            latents: latents.clone(),
            f_maps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::module::ModuleParameters;
    use serial_test::serial;

    fn tiny() -> StyleGenerator {
        StyleGenerator::new(GeneratorConfig::new(16, 8, 2, 1, 16)).unwrap()
    }

    #[test]
    #[serial]
    fn test_generate_shapes() {
        crate::seed_tensor_rng(3).unwrap();
        let g = tiny();
        let z = mlx_rs::random::normal::<f32>(&[2, 8], None, None, None).unwrap();
        let out = g.generate(&[z], true).unwrap();
        assert_eq!(out.image.shape(), &[2, 3, 16, 16]);
        assert_eq!(out.latents.shape(), &[2, 6, 8]);
        // 4x4, 8x8, 16x16
        assert_eq!(out.f_maps.len(), 3);
        assert_eq!(out.f_maps[2].shape(), &[2, 16, 16, 16]);
    }

    #[test]
    #[serial]
    fn test_no_f_maps_unless_requested() {
        crate::seed_tensor_rng(4).unwrap();
        let g = tiny();
        let z = mlx_rs::random::normal::<f32>(&[1, 8], None, None, None).unwrap();
        assert!(g.generate(&[z], false).unwrap().f_maps.is_empty());
    }

    #[test]
    #[serial]
    fn test_mixing_crosses_over_once() {
        crate::seed_tensor_rng(5).unwrap();
        let g = tiny();
        let z1 = mlx_rs::random::normal::<f32>(&[1, 8], None, None, None).unwrap();
        let z2 = mlx_rs::random::normal::<f32>(&[1, 8], None, None, None).unwrap();
        let w1 = g.mapping(&z1).unwrap();
        let mixed = g.map_styles(&[z1, z2]).unwrap();

        // Layer 0 always comes from the first batch, the last from the second.
        let first = mixed.index((.., 0, ..)).subtract(&w1).unwrap().abs().unwrap();
        assert!(first.max(None).unwrap().item::<f32>() < 1e-6);
        let last = mixed.index((.., 5, ..)).subtract(&w1).unwrap().abs().unwrap();
        assert!(last.max(None).unwrap().item::<f32>() > 1e-6);
    }

    #[test]
    #[serial]
    fn test_style_keys_are_mapping_only() {
        crate::seed_tensor_rng(6).unwrap();
        let g = tiny();
        let params = g.parameters().flatten();
        let style_keys: Vec<_> = params.keys().filter(|k| k.contains("style")).collect();
        assert_eq!(style_keys.len(), 4);
        assert!(style_keys.iter().all(|k| k.starts_with("style.")));
    }

    #[test]
    fn test_rejects_three_noises() {
        let g = tiny();
        let z = Array::from_slice(&[0.0f32; 8], &[1, 8]);
        assert!(g.map_styles(&[z.clone(), z.clone(), z]).is_err());
    }
}
