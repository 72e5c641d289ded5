//! Training configuration for generator compression.
//!
//! Every knob of a compression run lives in [`CompressConfig`]. Defaults
//! reproduce the reference StyleGAN2 compression recipe; a YAML file may
//! override any subset of them and the CLI overrides the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, StyleKdError};

/// Full configuration of a compression run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressConfig {
    /// Root directory of the real-image dataset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Last iteration to run (inclusive upper bound of the loop).
    #[serde(default = "default_iter")]
    pub iter: usize,

    /// Batch size per process.
    #[serde(default = "default_batch")]
    pub batch: usize,

    /// Number of fixed latents used for sample grids.
    #[serde(default = "default_n_sample")]
    pub n_sample: usize,

    /// Teacher output resolution.
    #[serde(default = "default_size")]
    pub size: usize,

    /// Student output resolution (and real-image resolution).
    #[serde(default = "default_size")]
    pub size_s: usize,

    /// R1 penalty weight.
    #[serde(default = "default_r1")]
    pub r1: f32,

    /// Path-length regularization weight.
    #[serde(default = "default_path_regularize")]
    pub path_regularize: f32,

    /// Batch divisor for the path-length regularization pass.
    #[serde(default = "default_path_batch_shrink")]
    pub path_batch_shrink: usize,

    /// Interval (in iterations) between R1 passes.
    #[serde(default = "default_d_reg_every")]
    pub d_reg_every: usize,

    /// Interval (in iterations) between path-length passes.
    #[serde(default = "default_g_reg_every")]
    pub g_reg_every: usize,

    /// Style mixing probability.
    #[serde(default = "default_mixing")]
    pub mixing: f32,

    /// Teacher checkpoint.
    #[serde(default)]
    pub ckpt: Option<PathBuf>,

    /// Student checkpoint to resume from.
    #[serde(default)]
    pub ckpt_s: Option<PathBuf>,

    /// Base learning rate.
    #[serde(default = "default_lr")]
    pub lr: f32,

    /// Teacher channel multiplier.
    #[serde(default = "default_channel_multiplier")]
    pub channel_multiplier: usize,

    /// Student channel multiplier.
    #[serde(default = "default_channel_multiplier_s")]
    pub channel_multiplier_s: usize,

    /// Maximum channel width of both networks.
    #[serde(default = "default_channel_base")]
    pub channel_base: usize,

    /// Emit per-iteration metrics to the JSONL sink.
    #[serde(default, alias = "wandb")]
    pub metrics: bool,

    /// Metrics sink location; defaults to `<expr_dir>/metrics.jsonl`.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,

    /// Apply stochastic augmentation to discriminator inputs.
    #[serde(default)]
    pub augment: bool,

    /// Fixed augmentation probability; zero enables adaptive tuning.
    #[serde(default)]
    pub augment_p: f32,

    /// Target sign statistic for adaptive augmentation.
    #[serde(default = "default_ada_target")]
    pub ada_target: f32,

    /// Number of images for the augmentation probability to move by one.
    #[serde(default = "default_ada_length")]
    pub ada_length: usize,

    /// Recorded in the saved configuration only. Adaptive augmentation
    /// always updates its probability every 8 discriminator steps and never
    /// reads this value.
    #[serde(default = "default_ada_every")]
    pub ada_every: usize,

    /// Add the kernel-alignment feature distillation term.
    #[serde(default)]
    pub kernel_alignment: bool,

    /// Add the perceptual distillation term.
    #[serde(default)]
    pub perc_loss: bool,

    /// Optional safetensors file with perceptual linear-head weights.
    #[serde(default)]
    pub perc_weights: Option<PathBuf>,

    /// Pretrained VGG backbone (torchvision `features.{i}` names) for the
    /// perceptual term. Without it the distance runs on a Laplacian pyramid.
    #[serde(default)]
    pub perc_backbone: Option<PathBuf>,

    /// Copy the teacher's style network into the student at startup.
    #[serde(default)]
    pub inherit_style: bool,

    /// Experiment output directory.
    #[serde(default = "default_expr_dir")]
    pub expr_dir: PathBuf,

    /// Latent (and style) dimension.
    #[serde(default = "default_latent")]
    pub latent: usize,

    /// Depth of the style-mapping network.
    #[serde(default = "default_n_mlp")]
    pub n_mlp: usize,

    /// Seed for every random source.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Interval between sample grids.
    #[serde(default = "default_sample_every")]
    pub sample_every: usize,

    /// Interval between checkpoints.
    #[serde(default = "default_save_every")]
    pub save_every: usize,
}

// Default functions for serde
fn default_iter() -> usize {
    800_000
}
fn default_batch() -> usize {
    16
}
fn default_n_sample() -> usize {
    64
}
fn default_size() -> usize {
    256
}
fn default_r1() -> f32 {
    10.0
}
fn default_path_regularize() -> f32 {
    2.0
}
fn default_path_batch_shrink() -> usize {
    2
}
fn default_d_reg_every() -> usize {
    16
}
fn default_g_reg_every() -> usize {
    4
}
fn default_mixing() -> f32 {
    0.9
}
fn default_lr() -> f32 {
    0.002
}
fn default_channel_multiplier() -> usize {
    2
}
fn default_channel_multiplier_s() -> usize {
    1
}
fn default_channel_base() -> usize {
    512
}
fn default_ada_target() -> f32 {
    0.6
}
fn default_ada_length() -> usize {
    500_000
}
fn default_ada_every() -> usize {
    256
}
fn default_expr_dir() -> PathBuf {
    PathBuf::from("./expr")
}
fn default_latent() -> usize {
    512
}
fn default_n_mlp() -> usize {
    8
}
fn default_seed() -> u64 {
    42
}
fn default_sample_every() -> usize {
    1000
}
fn default_save_every() -> usize {
    10_000
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            path: None,
            iter: default_iter(),
            batch: default_batch(),
            n_sample: default_n_sample(),
            size: default_size(),
            size_s: default_size(),
            r1: default_r1(),
            path_regularize: default_path_regularize(),
            path_batch_shrink: default_path_batch_shrink(),
            d_reg_every: default_d_reg_every(),
            g_reg_every: default_g_reg_every(),
            mixing: default_mixing(),
            ckpt: None,
            ckpt_s: None,
            lr: default_lr(),
            channel_multiplier: default_channel_multiplier(),
            channel_multiplier_s: default_channel_multiplier_s(),
            channel_base: default_channel_base(),
            metrics: false,
            metrics_path: None,
            augment: false,
            augment_p: 0.0,
            ada_target: default_ada_target(),
            ada_length: default_ada_length(),
            ada_every: default_ada_every(),
            kernel_alignment: false,
            perc_loss: false,
            perc_weights: None,
            perc_backbone: None,
            inherit_style: false,
            expr_dir: default_expr_dir(),
            latent: default_latent(),
            n_mlp: default_n_mlp(),
            seed: default_seed(),
            sample_every: default_sample_every(),
            save_every: default_save_every(),
        }
    }
}

impl CompressConfig {
    /// Load a configuration from a YAML file, filling unspecified knobs with defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write the configuration as YAML.
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Check the knobs for values the training loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch", self.batch),
            ("n_sample", self.n_sample),
            ("path_batch_shrink", self.path_batch_shrink),
            ("d_reg_every", self.d_reg_every),
            ("g_reg_every", self.g_reg_every),
            ("ada_length", self.ada_length),
            ("latent", self.latent),
            ("n_mlp", self.n_mlp),
            ("channel_base", self.channel_base),
            ("channel_multiplier", self.channel_multiplier),
            ("channel_multiplier_s", self.channel_multiplier_s),
            ("sample_every", self.sample_every),
            ("save_every", self.save_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StyleKdError::Config(format!("{name} must be > 0")));
            }
        }

        for (name, size) in [("size", self.size), ("size_s", self.size_s)] {
            if size < 4 || !size.is_power_of_two() {
                return Err(StyleKdError::Config(format!(
                    "{name} must be a power of two >= 4, got {size}"
                )));
            }
        }

        for (name, p) in [
            ("mixing", self.mixing),
            ("augment_p", self.augment_p),
            ("ada_target", self.ada_target),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(StyleKdError::Config(format!(
                    "{name} must be in [0, 1], got {p}"
                )));
            }
        }

        if self.lr <= 0.0 {
            return Err(StyleKdError::Config(format!(
                "lr must be > 0, got {}",
                self.lr
            )));
        }

        Ok(())
    }

    /// Lazy-regularization ratio for the generator optimizer.
    pub fn g_reg_ratio(&self) -> f32 {
        reg_ratio(self.g_reg_every)
    }

    /// Lazy-regularization ratio for the discriminator optimizer.
    pub fn d_reg_ratio(&self) -> f32 {
        reg_ratio(self.d_reg_every)
    }

    /// Batch size of the path-length regularization pass.
    pub fn path_batch_size(&self) -> usize {
        (self.batch / self.path_batch_shrink.max(1)).max(1)
    }

    /// Whether the augmentation probability is tuned online.
    pub fn adaptive_augment(&self) -> bool {
        self.augment && self.augment_p == 0.0
    }

    /// Directory receiving sample grids.
    pub fn sample_dir(&self) -> PathBuf {
        self.expr_dir.join("sample")
    }

    /// Directory receiving checkpoints.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.expr_dir.join("checkpoints")
    }

    /// Resolved metrics sink path.
    pub fn resolved_metrics_path(&self) -> PathBuf {
        self.metrics_path
            .clone()
            .unwrap_or_else(|| self.expr_dir.join("metrics.jsonl"))
    }
}

/// `reg_every / (reg_every + 1)`.
pub fn reg_ratio(reg_every: usize) -> f32 {
    reg_every as f32 / (reg_every as f32 + 1.0)
}
