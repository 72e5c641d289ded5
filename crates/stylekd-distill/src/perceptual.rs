//! LPIPS-form perceptual distance.
//!
//! Both images are passed through a fixed [`FeatureExtractor`]. Every
//! feature map is unit-normalized along channels, the squared difference is
//! weighted per channel by a non-negative linear head, averaged over space
//! and summed over layers, giving one distance per sample.
//!
//! The learned metric uses [`VggFeatures`], a pretrained VGG trunk read from
//! safetensors with torchvision `features.{i}` names, tapped at the last
//! ReLU before each max-pool (`relu1_2` .. `relu5_3` for VGG16). Without a
//! backbone file the distance falls back to a [`LaplacianPyramid`].

use std::collections::BTreeMap;
use std::path::Path;

use mlx_rs::{error::Exception, nn, ops, Array};
use stylekd_models::layers::conv2d_nchw;
use stylekd_models::resize::{downsample2x, upsample2x};

use crate::{DistillError, Result};

/// Fixed (non-trainable) multi-layer image features.
pub trait FeatureExtractor {
    /// Channel count of each feature layer.
    fn channels(&self) -> Vec<usize>;

    /// Feature maps `[B, C_l, H_l, W_l]` for `[B, 3, H, W]` images.
    fn features(&self, images: &Array) -> std::result::Result<Vec<Array>, Exception>;
}

/// Gaussian-free Laplacian pyramid: at each octave, the image and its
/// band-pass detail (`x - up(down(x))`).
#[derive(Debug, Clone, Copy)]
pub struct LaplacianPyramid {
    /// Number of octaves.
    pub levels: usize,
}

impl Default for LaplacianPyramid {
    fn default() -> Self {
        Self { levels: 4 }
    }
}

impl FeatureExtractor for LaplacianPyramid {
    fn channels(&self) -> Vec<usize> {
        vec![6; self.levels]
    }

    fn features(&self, images: &Array) -> std::result::Result<Vec<Array>, Exception> {
        let mut maps = Vec::with_capacity(self.levels);
        let mut x = images.clone();
        for _ in 0..self.levels {
            if x.dim(2) < 2 || x.dim(3) < 2 {
                // Too small to split further; reuse the coarsest level.
                let detail = x.multiply(Array::from_f32(0.0))?;
                maps.push(ops::concatenate_axis(&[&x, &detail], 1)?);
                continue;
            }
            let coarse = downsample2x(&x)?;
            let detail = x.subtract(&upsample2x(&coarse)?)?;
            maps.push(ops::concatenate_axis(&[&x, &detail], 1)?);
            x = coarse;
        }
        Ok(maps)
    }
}

/// LPIPS input normalization: `(x - shift) / scale` per RGB channel.
const VGG_SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
const VGG_SCALE: [f32; 3] = [0.458, 0.448, 0.450];

/// One same-padded 3x3 convolution followed by ReLU.
#[derive(Debug, Clone)]
struct VggConv {
    weight: Array,
    bias: Array,
}

/// Pretrained VGG-style convolution trunk.
///
/// Convolutions are read from `features.{i}.weight` / `features.{i}.bias`.
/// Index gaps follow the torchvision layout: a gap of 2 between two
/// convolutions is a ReLU, a gap of 3 is a ReLU and a 2x2 max-pool, which
/// closes a tapped stage.
#[derive(Debug, Clone)]
pub struct VggFeatures {
    stages: Vec<Vec<VggConv>>,
}

impl VggFeatures {
    /// Build the trunk from a safetensors file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let weights = stylekd_models::read_safetensors(path)?;
        let features = Self::from_weights(&weights)?;
        tracing::info!(
            path = %path.display(),
            stages = features.stages.len(),
            channels = ?features.channels(),
            "loaded perceptual backbone"
        );
        Ok(features)
    }

    /// Build the trunk from `features.{i}.*` arrays.
    pub fn from_weights(weights: &std::collections::HashMap<String, Array>) -> Result<Self> {
        let mut convs: BTreeMap<usize, VggConv> = BTreeMap::new();
        for (key, weight) in weights {
            let Some(index) = key
                .strip_prefix("features.")
                .and_then(|rest| rest.strip_suffix(".weight"))
                .and_then(|i| i.parse::<usize>().ok())
            else {
                continue;
            };
            if weight.ndim() != 4 || weight.dim(2) != 3 || weight.dim(3) != 3 {
                return Err(DistillError::InvalidConfig(format!(
                    "backbone conv {key} must be [out, in, 3, 3], got {:?}",
                    weight.shape()
                )));
            }
            let bias_key = format!("features.{index}.bias");
            let bias = weights
                .get(&bias_key)
                .ok_or_else(|| DistillError::InvalidConfig(format!("missing backbone bias {bias_key}")))?;
            let out = weight.dim(0);
            convs.insert(
                index,
                VggConv {
                    weight: weight.clone(),
                    bias: bias.reshape(&[1, out, 1, 1])?,
                },
            );
        }
        if convs.is_empty() {
            return Err(DistillError::InvalidConfig(
                "backbone holds no features.{i}.weight convolutions".to_string(),
            ));
        }

        let mut stages: Vec<Vec<VggConv>> = vec![Vec::new()];
        let mut previous: Option<(usize, i32)> = None;
        for (index, conv) in convs {
            if let Some((prev_index, prev_out)) = previous {
                if conv.weight.dim(1) != prev_out {
                    return Err(DistillError::InvalidConfig(format!(
                        "backbone conv features.{index} expects {} channels, previous layer gives {prev_out}",
                        conv.weight.dim(1)
                    )));
                }
                match index - prev_index {
                    2 => {}
                    3 => stages.push(Vec::new()),
                    gap => {
                        return Err(DistillError::InvalidConfig(format!(
                            "unexpected gap of {gap} between backbone convs {prev_index} and {index}"
                        )))
                    }
                }
            } else if conv.weight.dim(1) != 3 {
                return Err(DistillError::InvalidConfig(format!(
                    "first backbone conv expects {} channels, images have 3",
                    conv.weight.dim(1)
                )));
            }
            previous = Some((index, conv.weight.dim(0)));
            if let Some(stage) = stages.last_mut() {
                stage.push(conv);
            }
        }
        Ok(Self { stages })
    }
}

fn max_pool2x(x: &Array) -> std::result::Result<Array, Exception> {
    let (b, c, h, w) = (x.dim(0), x.dim(1), x.dim(2), x.dim(3));
    if h < 2 || w < 2 || h % 2 != 0 || w % 2 != 0 {
        return Ok(x.clone());
    }
    x.reshape(&[b, c, h / 2, 2, w / 2, 2])?.max_axes(&[3, 5], None)
}

impl FeatureExtractor for VggFeatures {
    fn channels(&self) -> Vec<usize> {
        self.stages
            .iter()
            .filter_map(|stage| stage.last().map(|conv| conv.weight.dim(0) as usize))
            .collect()
    }

    fn features(&self, images: &Array) -> std::result::Result<Vec<Array>, Exception> {
        let shift = Array::from_slice(&VGG_SHIFT, &[1, 3, 1, 1]);
        let scale = Array::from_slice(&VGG_SCALE, &[1, 3, 1, 1]);
        let mut x = images.subtract(&shift)?.divide(&scale)?;
        let mut maps = Vec::with_capacity(self.stages.len());
        for (s, stage) in self.stages.iter().enumerate() {
            if s > 0 {
                x = max_pool2x(&x)?;
            }
            for conv in stage {
                x = nn::relu(&conv_2d_bias(&x, conv)?)?;
            }
            maps.push(x.clone());
        }
        Ok(maps)
    }
}

fn conv_2d_bias(x: &Array, conv: &VggConv) -> std::result::Result<Array, Exception> {
    conv2d_nchw(x, &conv.weight, 1)?.add(&conv.bias)
}

/// Perceptual distance with per-layer linear heads.
pub struct PerceptualLoss {
    extractor: Box<dyn FeatureExtractor>,
    heads: Vec<Array>,
}

impl std::fmt::Debug for PerceptualLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerceptualLoss")
            .field("layers", &self.heads.len())
            .finish()
    }
}

impl Default for PerceptualLoss {
    fn default() -> Self {
        Self::new(Box::new(LaplacianPyramid::default()))
    }
}

impl PerceptualLoss {
    /// Use `extractor` with unit head weights.
    pub fn new(extractor: Box<dyn FeatureExtractor>) -> Self {
        let heads = extractor
            .channels()
            .into_iter()
            .map(|c| Array::from_slice(&vec![1.0f32; c], &[1, c as i32, 1, 1]))
            .collect();
        Self { extractor, heads }
    }

    /// Learned metric over a pretrained backbone, with optional head weights.
    ///
    /// Without a backbone this is the pyramid distance; heads are loaded
    /// either way when `heads` is given.
    pub fn from_files(backbone: Option<&Path>, heads: Option<&Path>) -> Result<Self> {
        let loss = match backbone {
            Some(path) => Self::new(Box::new(VggFeatures::from_file(path)?)),
            None => Self::default(),
        };
        match heads {
            Some(path) => loss.with_heads_from_file(path),
            None => Ok(loss),
        }
    }

    /// Channel count of each layer the distance compares.
    pub fn channels(&self) -> Vec<usize> {
        self.extractor.channels()
    }

    /// Replace head weights with `lin{l}.weight` (or LPIPS-style
    /// `lin{l}.model.1.weight`) arrays from a safetensors file.
    ///
    /// Each array must hold exactly `C_l` non-negative values.
    pub fn with_heads_from_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let weights = stylekd_models::read_safetensors(path.as_ref())?;
        let channels = self.extractor.channels();
        for (layer, c) in channels.into_iter().enumerate() {
            let key = format!("lin{layer}.weight");
            let w = weights
                .get(&key)
                .or_else(|| weights.get(&format!("lin{layer}.model.1.weight")))
                .ok_or_else(|| DistillError::InvalidConfig(format!("missing perceptual head {key}")))?;
            if w.size() != c {
                return Err(DistillError::InvalidConfig(format!(
                    "perceptual head {key} has {} values, expected {c}",
                    w.size()
                )));
            }
            let w = w.reshape(&[1, c as i32, 1, 1])?;
            let min = w.min(None)?.item::<f32>();
            if min < 0.0 {
                return Err(DistillError::InvalidConfig(format!(
                    "perceptual head {key} has negative weights"
                )));
            }
            self.heads[layer] = w;
        }
        tracing::info!(path = %path.as_ref().display(), "loaded perceptual heads");
        Ok(self)
    }

    /// Per-sample distance `[B]` between two equally shaped image batches.
    pub fn distance(&self, a: &Array, b: &Array) -> std::result::Result<Array, Exception> {
        if a.shape() != b.shape() {
            return Err(Exception::custom(format!(
                "perceptual inputs differ in shape: {:?} vs {:?}",
                a.shape(),
                b.shape()
            )));
        }
        let fa = self.extractor.features(a)?;
        let fb = self.extractor.features(b)?;

        let batch = a.dim(0);
        let mut total = ops::zeros::<f32>(&[batch])?;
        for ((xa, xb), head) in fa.iter().zip(&fb).zip(&self.heads) {
            let diff = normalize_channels(xa)?.subtract(&normalize_channels(xb)?)?;
            let layer = diff
                .square()?
                .multiply(head)?
                .sum_axis(1, None)?
                .mean_axes(&[1, 2], None)?;
            total = total.add(&layer)?;
        }
        Ok(total)
    }
}

fn normalize_channels(x: &Array) -> std::result::Result<Array, Exception> {
    let norm = x.square()?.sum_axes(&[1], Some(true))?.sqrt()?;
    x.divide(&norm.add(Array::from_f32(1e-10))?)
}
