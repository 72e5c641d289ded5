//! Reference image discriminator.

use mlx_rs::{error::Exception, macros::ModuleParameters, ops, Array};

use crate::config::DiscriminatorConfig;
use crate::error::Result;
use crate::layers::{fused_leaky_relu, EqualConv2d, EqualLinear};
use crate::resize::downsample2x;
use crate::traits::ImageDiscriminator;

/// Two convolutions around a 2x average-pool.
#[derive(Debug, ModuleParameters)]
pub struct DownBlock {
    /// Convolution at the input resolution.
    #[param]
    pub conv1: EqualConv2d,
    /// Convolution after downsampling.
    #[param]
    pub conv2: EqualConv2d,
}

impl DownBlock {
    fn new(in_channels: usize, out_channels: usize) -> std::result::Result<Self, Exception> {
        Ok(Self {
            conv1: EqualConv2d::new(in_channels, in_channels, 3)?,
            conv2: EqualConv2d::new(in_channels, out_channels, 3)?,
        })
    }

    fn forward(&self, x: &Array) -> std::result::Result<Array, Exception> {
        let h = fused_leaky_relu(&self.conv1.forward(x)?)?;
        let h = downsample2x(&h)?;
        fused_leaky_relu(&self.conv2.forward(&h)?)
    }
}

/// Discriminator mirroring the generator's channel table, with a
/// minibatch-stddev feature at 4x4.
#[derive(Debug, ModuleParameters)]
pub struct StyleDiscriminator {
    /// Shape configuration (not a parameter).
    pub config: DiscriminatorConfig,
    /// 1x1 projection from RGB.
    #[param]
    pub from_rgb: EqualConv2d,
    /// One block per octave down to 4x4.
    #[param]
    pub blocks: Vec<DownBlock>,
    /// 4x4 convolution over features plus the stddev channel.
    #[param]
    pub final_conv: EqualConv2d,
    /// Flattened 4x4 features to hidden.
    #[param]
    pub final_linear: EqualLinear,
    /// Hidden to logit.
    #[param]
    pub final_out: EqualLinear,
}

impl StyleDiscriminator {
    /// Build a randomly initialized discriminator.
    pub fn new(config: DiscriminatorConfig) -> Result<Self> {
        config.validate()?;
        let log_size = config.size.trailing_zeros() as usize;

        let from_rgb = EqualConv2d::new(3, config.channels(config.size), 1)?;
        let mut blocks = Vec::new();
        for level in (3..=log_size).rev() {
            let in_channels = config.channels(1 << level);
            let out_channels = config.channels(1 << (level - 1));
            blocks.push(DownBlock::new(in_channels, out_channels)?);
        }

        let c4 = config.channels(4);
        let final_conv = EqualConv2d::new(c4 + 1, c4, 3)?;
        let final_linear = EqualLinear::new(c4 * 16, c4, 0.0, 1.0, true)?;
        let final_out = EqualLinear::new(c4, 1, 0.0, 1.0, false)?;

        Ok(Self {
            config,
            from_rgb,
            blocks,
            final_conv,
            final_linear,
            final_out,
        })
    }
}

/// Append the batch-wide standard deviation as one constant channel.
fn minibatch_stddev(x: &Array) -> std::result::Result<Array, Exception> {
    let shape = x.shape();
    let (b, h, w) = (shape[0], shape[2], shape[3]);
    let mean = x.mean_axes(&[0], Some(true))?;
    let var = x.subtract(&mean)?.square()?.mean_axes(&[0], Some(true))?;
    let std = var.add(Array::from_f32(1e-8))?.sqrt()?;
    let stat = std.mean_axes(&[1, 2, 3], Some(true))?;
    let channel = ops::broadcast_to(&stat, &[b, 1, h, w])?;
    ops::concatenate_axis(&[x, &channel], 1)
}

impl ImageDiscriminator for StyleDiscriminator {
    fn forward(&self, images: &Array) -> std::result::Result<Array, Exception> {
        let size = self.config.size as i32;
        let shape = images.shape();
        if shape.len() != 4 || shape[1] != 3 || shape[2] != size || shape[3] != size {
            return Err(Exception::custom(format!(
                "discriminator expects [B, 3, {size}, {size}], got {shape:?}"
            )));
        }

        let mut out = fused_leaky_relu(&self.from_rgb.forward(images)?)?;
        for block in &self.blocks {
            out = block.forward(&out)?;
        }

        let out = minibatch_stddev(&out)?;
        let out = fused_leaky_relu(&self.final_conv.forward(&out)?)?;
        let batch = out.dim(0);
        let out = out.reshape(&[batch, -1])?;
        let out = self.final_linear.forward(&out)?;
        self.final_out.forward(&out)
    }
}
