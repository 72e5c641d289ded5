//! Equalized-learning-rate building blocks.
//!
//! All weights are stored at unit variance and rescaled by `1/sqrt(fan_in)`
//! at runtime. Modulated convolutions scale activations by the per-sample
//! style instead of materializing per-sample kernels, which is exactly
//! equivalent to weight modulation followed by demodulation.

use std::f32::consts::SQRT_2;

use mlx_rs::{error::Exception, macros::ModuleParameters, module::Param, ops, Array};

use crate::resize::upsample2x;

/// Leaky ReLU (slope 0.2) with the `sqrt(2)` gain used throughout the networks.
pub fn fused_leaky_relu(x: &Array) -> Result<Array, Exception> {
    let leaked = x.multiply(Array::from_f32(0.2))?;
    ops::maximum(x, &leaked)?.multiply(Array::from_f32(SQRT_2))
}

/// Normalize each latent to unit root-mean-square.
pub fn pixel_norm(x: &Array) -> Result<Array, Exception> {
    let ms = x.square()?.mean_axes(&[-1], Some(true))?;
    x.multiply(&ms.add(Array::from_f32(1e-8))?.rsqrt()?)
}

/// Same-padded stride-1 convolution on NCHW input with an OIHW kernel.
pub fn conv2d_nchw(x: &Array, weight: &Array, padding: i32) -> Result<Array, Exception> {
    let x_nhwc = x.transpose_axes(&[0, 2, 3, 1])?;
    let w_ohwi = weight.transpose_axes(&[0, 2, 3, 1])?;
    let out = ops::conv2d(&x_nhwc, &w_ohwi, (1, 1), (padding, padding), (1, 1), 1)?;
    out.transpose_axes(&[0, 3, 1, 2])
}

/// Fully connected layer with equalized learning rate.
#[derive(Debug, ModuleParameters)]
pub struct EqualLinear {
    /// Weight `[out, in]`, stored divided by `lr_mul`.
    #[param]
    pub weight: Param<Array>,
    /// Bias `[out]`, stored divided by `lr_mul`.
    #[param]
    pub bias: Param<Array>,
    /// Runtime weight scale.
    pub scale: f32,
    /// Learning-rate multiplier.
    pub lr_mul: f32,
    /// Apply the fused leaky ReLU.
    pub activate: bool,
}

impl EqualLinear {
    /// Create a new layer.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        bias_init: f32,
        lr_mul: f32,
        activate: bool,
    ) -> Result<Self, Exception> {
        let weight = mlx_rs::random::normal::<f32>(&[out_dim as i32, in_dim as i32], None, None, None)?
            .divide(Array::from_f32(lr_mul))?;
        let bias = ops::ones::<f32>(&[out_dim as i32])?.multiply(Array::from_f32(bias_init / lr_mul))?;
        Ok(Self {
            weight: Param::new(weight),
            bias: Param::new(bias),
            scale: lr_mul / (in_dim as f32).sqrt(),
            lr_mul,
            activate,
        })
    }

    /// `x @ (W * scale)ᵀ + b * lr_mul`, optionally activated.
    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let w = self.weight.multiply(Array::from_f32(self.scale))?;
        let b = self.bias.multiply(Array::from_f32(self.lr_mul))?;
        let out = x.matmul(&w.transpose_axes(&[1, 0])?)?.add(&b)?;
        if self.activate {
            fused_leaky_relu(&out)
        } else {
            Ok(out)
        }
    }
}

/// Convolution with equalized learning rate.
#[derive(Debug, ModuleParameters)]
pub struct EqualConv2d {
    /// Kernel `[out, in, k, k]`.
    #[param]
    pub weight: Param<Array>,
    /// Bias `[out]`.
    #[param]
    pub bias: Param<Array>,
    /// Output channels.
    pub out_channels: i32,
    /// Runtime weight scale.
    pub scale: f32,
    /// Spatial padding.
    pub padding: i32,
}

impl EqualConv2d {
    /// Create a new same-padded convolution.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Result<Self, Exception> {
        let k = kernel_size as i32;
        let weight = mlx_rs::random::normal::<f32>(
            &[out_channels as i32, in_channels as i32, k, k],
            None,
            None,
            None,
        )?;
        Ok(Self {
            weight: Param::new(weight),
            bias: Param::new(ops::zeros::<f32>(&[out_channels as i32])?),
            out_channels: out_channels as i32,
            scale: 1.0 / ((in_channels * kernel_size * kernel_size) as f32).sqrt(),
            padding: k / 2,
        })
    }

    /// Forward pass on `[B, in, H, W]`.
    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let w = self.weight.multiply(Array::from_f32(self.scale))?;
        let out = conv2d_nchw(x, &w, self.padding)?;
        out.add(&self.bias.reshape(&[1, self.out_channels, 1, 1])?)
    }
}

/// Style-modulated convolution.
#[derive(Debug, ModuleParameters)]
pub struct ModulatedConv2d {
    /// Kernel `[out, in, k, k]`.
    #[param]
    pub weight: Param<Array>,
    /// Affine map from style vector to per-input-channel scales.
    #[param]
    pub modulation: EqualLinear,
    /// Input channels.
    pub in_channels: i32,
    /// Output channels.
    pub out_channels: i32,
    /// Spatial padding.
    pub padding: i32,
    /// Runtime weight scale.
    pub scale: f32,
    /// Normalize output channels to unit expected variance.
    pub demodulate: bool,
    /// Upsample 2x before convolving.
    pub upsample: bool,
}

impl ModulatedConv2d {
    /// Create a new modulated convolution.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        style_dim: usize,
        demodulate: bool,
        upsample: bool,
    ) -> Result<Self, Exception> {
        let k = kernel_size as i32;
        let weight = mlx_rs::random::normal::<f32>(
            &[out_channels as i32, in_channels as i32, k, k],
            None,
            None,
            None,
        )?;
        Ok(Self {
            weight: Param::new(weight),
            modulation: EqualLinear::new(style_dim, in_channels, 1.0, 1.0, false)?,
            in_channels: in_channels as i32,
            out_channels: out_channels as i32,
            padding: k / 2,
            scale: 1.0 / ((in_channels * kernel_size * kernel_size) as f32).sqrt(),
            demodulate,
            upsample,
        })
    }

    /// Forward pass: `x` is `[B, in, H, W]`, `style` is `[B, style_dim]`.
    pub fn forward(&self, x: &Array, style: &Array) -> Result<Array, Exception> {
        let batch = x.dim(0);
        let s = self.modulation.forward(style)?;
        let mut h = x.multiply(&s.reshape(&[batch, self.in_channels, 1, 1])?)?;
        if self.upsample {
            h = upsample2x(&h)?;
        }

        let w = self.weight.multiply(Array::from_f32(self.scale))?;
        let out = conv2d_nchw(&h, &w, self.padding)?;
        if !self.demodulate {
            return Ok(out);
        }

        // d[b, o] = rsqrt(sum_i s[b, i]^2 * sum_k w[o, i, k]^2)
        let w_sq = w.square()?.sum_axes(&[2, 3], None)?;
        let demod = s
            .square()?
            .matmul(&w_sq.transpose_axes(&[1, 0])?)?
            .add(Array::from_f32(1e-8))?
            .rsqrt()?;
        out.multiply(&demod.reshape(&[batch, self.out_channels, 1, 1])?)
    }
}

/// Per-pixel noise with a learned strength.
#[derive(Debug, ModuleParameters)]
pub struct NoiseInjection {
    /// Noise strength (scalar).
    #[param]
    pub weight: Param<Array>,
}

impl NoiseInjection {
    /// Create with zero strength.
    pub fn new() -> Result<Self, Exception> {
        Ok(Self {
            weight: Param::new(ops::zeros::<f32>(&[1])?),
        })
    }

    /// Add `weight * N(0, 1)` broadcast over channels.
    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let shape = x.shape();
        let noise = mlx_rs::random::normal::<f32>(&[shape[0], 1, shape[2], shape[3]], None, None, None)?;
        x.add(&noise.multiply(&*self.weight)?)
    }
}

/// Modulated conv, noise, bias and activation.
#[derive(Debug, ModuleParameters)]
pub struct StyledConv {
    /// Modulated convolution.
    #[param]
    pub conv: ModulatedConv2d,
    /// Noise injection.
    #[param]
    pub noise: NoiseInjection,
    /// Activation bias `[1, out, 1, 1]`.
    #[param]
    pub activate_bias: Param<Array>,
}

impl StyledConv {
    /// Create a new styled convolution.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        style_dim: usize,
        upsample: bool,
    ) -> Result<Self, Exception> {
        Ok(Self {
            conv: ModulatedConv2d::new(in_channels, out_channels, kernel_size, style_dim, true, upsample)?,
            noise: NoiseInjection::new()?,
            activate_bias: Param::new(ops::zeros::<f32>(&[1, out_channels as i32, 1, 1])?),
        })
    }

    /// Forward pass.
    pub fn forward(&self, x: &Array, style: &Array) -> Result<Array, Exception> {
        let out = self.conv.forward(x, style)?;
        let out = self.noise.forward(&out)?;
        fused_leaky_relu(&out.add(&*self.activate_bias)?)
    }
}

/// Projection of features to RGB, accumulated over resolutions.
#[derive(Debug, ModuleParameters)]
pub struct ToRgb {
    /// Non-demodulated 1x1 modulated convolution.
    #[param]
    pub conv: ModulatedConv2d,
    /// RGB bias `[1, 3, 1, 1]`.
    #[param]
    pub bias: Param<Array>,
}

impl ToRgb {
    /// Create a new RGB head.
    pub fn new(in_channels: usize, style_dim: usize) -> Result<Self, Exception> {
        Ok(Self {
            conv: ModulatedConv2d::new(in_channels, 3, 1, style_dim, false, false)?,
            bias: Param::new(ops::zeros::<f32>(&[1, 3, 1, 1])?),
        })
    }

    /// Project `x` and add the upsampled image from the previous resolution.
    pub fn forward(&self, x: &Array, style: &Array, skip: Option<&Array>) -> Result<Array, Exception> {
        let out = self.conv.forward(x, style)?.add(&*self.bias)?;
        match skip {
            Some(skip) => out.add(&upsample2x(skip)?),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_leaky_relu_gain() {
        let x = Array::from_slice(&[-1.0f32, 2.0], &[2]);
        let y = fused_leaky_relu(&x).unwrap();
        y.eval().unwrap();
        let v = y.as_slice::<f32>();
        assert!((v[0] + 0.2 * SQRT_2).abs() < 1e-5);
        assert!((v[1] - 2.0 * SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_pixel_norm_unit_rms() {
        let x = Array::from_slice(&[3.0f32, 4.0, 0.0, 0.0], &[1, 4]);
        let y = pixel_norm(&x).unwrap();
        let rms = y.square().unwrap().mean(None).unwrap().item::<f32>();
        assert!((rms - 1.0).abs() < 1e-4);
    }

    #[test]
    #[serial]
    fn test_modulated_conv_shapes() {
        crate::seed_tensor_rng(0).unwrap();
        let conv = ModulatedConv2d::new(4, 6, 3, 8, true, true).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 4, 4, 4], None, None, None).unwrap();
        let style = mlx_rs::random::normal::<f32>(&[2, 8], None, None, None).unwrap();
        let out = conv.forward(&x, &style).unwrap();
        assert_eq!(out.shape(), &[2, 6, 8, 8]);
    }

    #[test]
    #[serial]
    fn test_equal_conv_same_padding() {
        crate::seed_tensor_rng(1).unwrap();
        let conv = EqualConv2d::new(3, 5, 3).unwrap();
        let x = ops::ones::<f32>(&[1, 3, 8, 8]).unwrap();
        assert_eq!(conv.forward(&x).unwrap().shape(), &[1, 5, 8, 8]);
    }
}
