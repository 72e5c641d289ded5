//! StyleKD CLI - compress a StyleGAN2 generator by knowledge distillation.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use stylekd_core::CompressConfig;
use stylekd_data::{ImageDataset, ImageFolderDataset, ImageLoader, InfiniteLoader, LoaderConfig};
use stylekd_distributed::DistributedContext;
use stylekd_models::{
    seed_tensor_rng, DiscriminatorConfig, GeneratorConfig, StyleDiscriminator, StyleGenerator,
    StyleKeyFilter,
};
use stylekd_trainer::{load_teacher, GanModels, MetricsJsonCallback, ProgressCallback, Trainer};

#[derive(Parser)]
#[command(name = "stylekd")]
#[command(author, version, about = "Compress a StyleGAN2 generator by knowledge distillation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a student generator against a pretrained teacher
    Train(TrainArgs),

    /// Write the default configuration as YAML
    InitConfig {
        /// Output file
        #[arg(short, long, default_value = "stylekd.yaml")]
        output: PathBuf,
    },
}

/// Command-line overrides. Anything left unset keeps the value from
/// `--config` (or the built-in default).
#[derive(Args, Debug, Default)]
struct TrainArgs {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of real training images
    path: Option<PathBuf>,

    /// Last training iteration
    #[arg(long)]
    iter: Option<usize>,

    /// Batch size per process
    #[arg(long)]
    batch: Option<usize>,

    /// Number of fixed latents in sample grids
    #[arg(long)]
    n_sample: Option<usize>,

    /// Teacher resolution
    #[arg(long)]
    size: Option<usize>,

    /// Student resolution
    #[arg(long)]
    size_s: Option<usize>,

    /// R1 regularization weight
    #[arg(long)]
    r1: Option<f32>,

    /// Path-length regularization weight
    #[arg(long)]
    path_regularize: Option<f32>,

    /// Batch divisor for path-length regularization
    #[arg(long)]
    path_batch_shrink: Option<usize>,

    /// Interval between R1 passes
    #[arg(long)]
    d_reg_every: Option<usize>,

    /// Interval between path-length passes
    #[arg(long)]
    g_reg_every: Option<usize>,

    /// Style mixing probability
    #[arg(long)]
    mixing: Option<f32>,

    /// Teacher checkpoint (safetensors)
    #[arg(long)]
    ckpt: Option<PathBuf>,

    /// Student checkpoint to resume from
    #[arg(long)]
    ckpt_s: Option<PathBuf>,

    /// Learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Teacher channel multiplier
    #[arg(long)]
    channel_multiplier: Option<usize>,

    /// Student channel multiplier
    #[arg(long)]
    channel_multiplier_s: Option<usize>,

    /// Maximum channel width
    #[arg(long)]
    channel_base: Option<usize>,

    /// Write per-iteration metrics to a JSONL file
    #[arg(long, alias = "wandb")]
    metrics: bool,

    /// Metrics file (defaults to <expr_dir>/metrics.jsonl)
    #[arg(long)]
    metrics_path: Option<PathBuf>,

    /// Augment discriminator inputs
    #[arg(long)]
    augment: bool,

    /// Fixed augmentation probability (0 enables adaptive tuning)
    #[arg(long)]
    augment_p: Option<f32>,

    /// Adaptive augmentation target
    #[arg(long)]
    ada_target: Option<f32>,

    /// Images for the augmentation probability to move by one
    #[arg(long)]
    ada_length: Option<usize>,

    /// Recorded in the saved configuration only; adaptive augmentation
    /// always updates every 8 discriminator steps
    #[arg(long)]
    ada_every: Option<usize>,

    /// Add the kernel-alignment distillation term
    #[arg(long)]
    kernel_alignment: bool,

    /// Add the perceptual distillation term
    #[arg(long)]
    perc_loss: bool,

    /// Perceptual head weights (safetensors)
    #[arg(long)]
    perc_weights: Option<PathBuf>,

    /// Pretrained VGG backbone for the perceptual term (safetensors)
    #[arg(long)]
    perc_backbone: Option<PathBuf>,

    /// Copy the teacher's style network into the student
    #[arg(long)]
    inherit_style: bool,

    /// Experiment output directory
    #[arg(long)]
    expr_dir: Option<PathBuf>,

    /// Latent dimension
    #[arg(long)]
    latent: Option<usize>,

    /// Mapping network depth
    #[arg(long)]
    n_mlp: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Interval between sample grids
    #[arg(long)]
    sample_every: Option<usize>,

    /// Interval between checkpoints
    #[arg(long)]
    save_every: Option<usize>,
}

macro_rules! override_fields {
    ($args:expr, $config:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = $args.$field.clone() {
                $config.$field = value;
            }
        )*
    };
}

impl TrainArgs {
    /// Resolve the run configuration: defaults, then the YAML file, then flags.
    fn resolve(&self) -> anyhow::Result<CompressConfig> {
        let mut config = match &self.config {
            Some(path) => CompressConfig::from_yaml_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => CompressConfig::default(),
        };

        override_fields!(self, config, [
            iter, batch, n_sample, size, size_s, r1, path_regularize, path_batch_shrink,
            d_reg_every, g_reg_every, mixing, lr, channel_multiplier, channel_multiplier_s,
            channel_base, augment_p, ada_target, ada_length, ada_every, expr_dir, latent,
            n_mlp, seed, sample_every, save_every,
        ]);
        for (flag, value) in [
            (&self.path, &mut config.path),
            (&self.ckpt, &mut config.ckpt),
            (&self.ckpt_s, &mut config.ckpt_s),
            (&self.metrics_path, &mut config.metrics_path),
            (&self.perc_weights, &mut config.perc_weights),
            (&self.perc_backbone, &mut config.perc_backbone),
        ] {
            if flag.is_some() {
                value.clone_from(flag);
            }
        }
        config.metrics |= self.metrics;
        config.augment |= self.augment;
        config.kernel_alignment |= self.kernel_alignment;
        config.perc_loss |= self.perc_loss;
        config.inherit_style |= self.inherit_style;

        config.validate()?;
        Ok(config)
    }
}

fn build_models(config: &CompressConfig) -> anyhow::Result<GanModels<StyleGenerator, StyleDiscriminator>> {
    let teacher = StyleGenerator::new(GeneratorConfig::new(
        config.size,
        config.latent,
        config.n_mlp,
        config.channel_multiplier,
        config.channel_base,
    ))?;
    let student_config = GeneratorConfig::new(
        config.size_s,
        config.latent,
        config.n_mlp,
        config.channel_multiplier_s,
        config.channel_base,
    );
    let generator = StyleGenerator::new(student_config.clone())?;
    let g_ema = StyleGenerator::new(student_config)?;
    let discriminator = StyleDiscriminator::new(DiscriminatorConfig {
        size: config.size_s,
        channel_multiplier: config.channel_multiplier_s,
        channel_base: config.channel_base,
    })?;
    Ok(GanModels::new(teacher, generator, discriminator, g_ema))
}

fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    let data_path = config
        .path
        .clone()
        .context("no dataset given: pass PATH or set `path` in the config file")?;

    std::fs::create_dir_all(&config.expr_dir)
        .with_context(|| format!("failed to create {}", config.expr_dir.display()))?;
    config.to_yaml_file(config.expr_dir.join("config.yaml"))?;

    let ctx = DistributedContext::default();
    let (rank, world_size) = (ctx.rank(), ctx.world_size());
    seed_tensor_rng(config.seed)?;
    let models = build_models(&config)?;
    let mut trainer = Trainer::new(config.clone(), models, ctx)?;

    if let Some(ckpt) = &config.ckpt {
        tracing::info!(path = %ckpt.display(), "load teacher model");
        load_teacher(ckpt, trainer.models_mut(), config.inherit_style, StyleKeyFilter::default())?;
    }
    let start_iter = match &config.ckpt_s {
        Some(ckpt_s) => trainer.resume(ckpt_s)?,
        None => 0,
    };

    let dataset = ImageFolderDataset::new(&data_path, config.size_s)
        .with_context(|| format!("failed to open dataset {}", data_path.display()))?;
    tracing::info!(images = dataset.len(), path = %data_path.display(), "loaded dataset");
    let loader = ImageLoader::new(
        Box::new(dataset),
        LoaderConfig {
            batch_size: config.batch,
            shuffle: true,
            seed: config.seed,
            drop_last: true,
            hflip: true,
            rank,
            world_size,
        },
    );
    let mut loader = InfiniteLoader::new(loader)?;

    trainer = trainer.with_callback(Box::new(ProgressCallback::new(config.iter)));
    if config.metrics {
        if let Some(sink) = MetricsJsonCallback::open_or_warn(config.resolved_metrics_path()) {
            trainer = trainer.with_callback(Box::new(sink.with_config(serde_json::to_value(&config)?)));
        }
    }

    let state = trainer.run(&mut loader, start_iter)?;
    tracing::info!(
        iteration = state.iteration,
        ada_aug_p = state.ada_aug_p,
        mean_path_length = state.mean_path_length_avg,
        "training finished"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::InitConfig { output } => {
            CompressConfig::default().to_yaml_file(&output)?;
            tracing::info!(path = %output.display(), "wrote default configuration");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("run.yaml");
        std::fs::write(&file, "batch: 4\nsize_s: 64\nwandb: true\n").unwrap();

        let cli = Cli::try_parse_from([
            "stylekd",
            "train",
            "--config",
            file.to_str().unwrap(),
            "data/ffhq",
            "--batch",
            "8",
            "--kernel-alignment",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.batch, 8);
        assert_eq!(config.size_s, 64);
        assert!(config.metrics);
        assert!(config.kernel_alignment);
        assert_eq!(config.path, Some(PathBuf::from("data/ffhq")));
        assert_eq!(config.d_reg_every, 16);
    }

    #[test]
    fn test_perceptual_and_ada_flags_land_in_config() {
        let cli = Cli::try_parse_from([
            "stylekd",
            "train",
            "data/ffhq",
            "--perc-loss",
            "--perc-backbone",
            "weights/vgg16.safetensors",
            "--ada-every",
            "4",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = args.resolve().unwrap();
        assert!(config.perc_loss);
        assert_eq!(config.perc_backbone, Some(PathBuf::from("weights/vgg16.safetensors")));
        assert_eq!(config.perc_weights, None);
        assert_eq!(config.ada_every, 4);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = TrainArgs {
            size_s: Some(100),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }
}
