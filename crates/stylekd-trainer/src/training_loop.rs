//! Compression training loop.
//!
//! One iteration `i`:
//!
//! 1. Discriminator step on a real batch and fresh student fakes.
//! 2. Adaptive augmentation tuning from the real logits.
//! 3. R1 on real images when `i % d_reg_every == 0`.
//! 4. Generator step: teacher and student consume the same noise; the loss
//!    is the non-saturating adversarial loss, minus summed kernel alignment
//!    of the feature maps, plus the perceptual distance to the teacher image
//!    resized to the student resolution.
//! 5. Path-length regularization when `i % g_reg_every == 0`.
//! 6. EMA update, loss reduction and rank-0 reporting, sampling and saving.
//!
//! The teacher's forward pass runs outside the differentiated closure, so
//! its outputs enter the generator loss as constants.

use std::cell::RefCell;

use mlx_rs::{error::Exception, nn, stop_gradient, Array};
use stylekd_core::CompressConfig;
use stylekd_data::{Augment, AugmentPipeline, InfiniteLoader};
use stylekd_distill::{
    discriminator_loss, feature_alignment, g_nonsaturating_loss, path_length_penalty,
    r1_penalty, DistillError, DiscriminatorLossOutput, PathLengthOutput, PerceptualLoss,
    PATH_LENGTH_DECAY,
};
use stylekd_distributed::{DistributedContext, LossDict};
use stylekd_models::{resize_bilinear, ImageDiscriminator, ImageGenerator};

use crate::ada::{AdaptiveAugment, ADA_UPDATE_EVERY};
use crate::callbacks::{StepMetrics, TrainingCallback};
use crate::checkpoint::{load_checkpoint, parse_resume_iteration, CheckpointManager, CheckpointMetadata};
use crate::ema::{accumulate, generator_ema_decay};
use crate::freeze::{GanModels, TrainingPhase};
use crate::noise::NoiseSampler;
use crate::optim::RegularizedAdam;
use crate::sampling::save_sample_grid;
use crate::{Result, TrainerError};

type MlxResult<T> = std::result::Result<T, Exception>;

/// Mutable loop state carried from one iteration to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainState {
    /// Last completed iteration.
    pub iteration: usize,
    /// Running mean path length on this process.
    pub mean_path_length: f32,
    /// Running mean path length averaged across processes.
    pub mean_path_length_avg: f32,
    /// Augmentation probability.
    pub ada_aug_p: f32,
    /// Adaptive augmentation sign statistic.
    pub r_t_stat: f32,
    /// Last computed R1 penalty.
    pub r1_loss: f32,
    /// Last computed path-length penalty.
    pub path_loss: f32,
    /// Last mean per-sample path length.
    pub path_length: f32,
}

/// Drives the four networks of a compression run.
pub struct Trainer<G, D> {
    config: CompressConfig,
    models: GanModels<G, D>,
    g_optim: RegularizedAdam,
    d_optim: RegularizedAdam,
    ctx: DistributedContext,
    augment: Box<dyn Augment>,
    ada: Option<AdaptiveAugment>,
    perceptual: Option<PerceptualLoss>,
    noise: NoiseSampler,
    sample_z: Array,
    ema_decay: f32,
    state: TrainState,
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl<G: ImageGenerator, D: ImageDiscriminator> Trainer<G, D> {
    /// Set up optimizers, augmentation and distillation terms for `config`.
    ///
    /// The EMA generator is initialized as a copy of the student generator.
    pub fn new(config: CompressConfig, mut models: GanModels<G, D>, ctx: DistributedContext) -> Result<Self> {
        config.validate()?;
        if models.teacher.resolution() != config.size {
            return Err(TrainerError::InvalidArgument(format!(
                "teacher generates {}px, config size is {}",
                models.teacher.resolution(),
                config.size
            )));
        }
        if models.generator.resolution() != config.size_s {
            return Err(TrainerError::InvalidArgument(format!(
                "student generates {}px, config size_s is {}",
                models.generator.resolution(),
                config.size_s
            )));
        }

        let g_optim = RegularizedAdam::lazy_regularized(config.lr, config.g_reg_every);
        let d_optim = RegularizedAdam::lazy_regularized(config.lr, config.d_reg_every);

        let ada = config
            .adaptive_augment()
            .then(|| AdaptiveAugment::new(config.ada_target, config.ada_length, ADA_UPDATE_EVERY));
        let ada_aug_p = if config.augment_p > 0.0 { config.augment_p } else { 0.0 };

        let perceptual = if config.perc_loss {
            Some(PerceptualLoss::from_files(
                config.perc_backbone.as_deref(),
                config.perc_weights.as_deref(),
            )?)
        } else {
            None
        };

        let noise = NoiseSampler::new(config.latent, config.seed.wrapping_add(ctx.rank() as u64));
        let sample_z = mlx_rs::random::normal::<f32>(
            &[config.n_sample as i32, config.latent as i32],
            None,
            None,
            None,
        )?;

        accumulate(&mut models.g_ema, &models.generator, 0.0)?;
        models.enter(TrainingPhase::Idle);

        tracing::info!(
            batch = config.batch,
            size = config.size,
            size_s = config.size_s,
            augment = config.augment,
            adaptive = ada.is_some(),
            kernel_alignment = config.kernel_alignment,
            perc_loss = config.perc_loss,
            world_size = ctx.world_size(),
            "initialized compression trainer"
        );

        Ok(Self {
            state: TrainState {
                ada_aug_p,
                ..Default::default()
            },
            config,
            models,
            g_optim,
            d_optim,
            ctx,
            augment: Box::new(AugmentPipeline::default()),
            ada,
            perceptual,
            noise,
            sample_z,
            ema_decay: generator_ema_decay(),
            callbacks: Vec::new(),
        })
    }

    /// Replace the augmentation pipeline.
    pub fn with_augment(mut self, augment: Box<dyn Augment>) -> Self {
        self.augment = augment;
        self
    }

    /// Register a rank-0 callback.
    pub fn with_callback(mut self, callback: Box<dyn TrainingCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Run configuration.
    pub fn config(&self) -> &CompressConfig {
        &self.config
    }

    /// Networks.
    pub fn models(&self) -> &GanModels<G, D> {
        &self.models
    }

    /// Networks, mutably (teacher loading, style inheritance).
    pub fn models_mut(&mut self) -> &mut GanModels<G, D> {
        &mut self.models
    }

    /// Loop state.
    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// Generator optimizer.
    pub fn g_optim(&self) -> &RegularizedAdam {
        &self.g_optim
    }

    /// Discriminator optimizer.
    pub fn d_optim(&self) -> &RegularizedAdam {
        &self.d_optim
    }

    /// Fixed latents the sample grids are drawn from.
    pub fn sample_z(&self) -> &Array {
        &self.sample_z
    }

    /// Reseed the tensor RNG and the mixing coin.
    pub fn reseed(&mut self, seed: u64) -> Result<()> {
        stylekd_models::seed_tensor_rng(seed)?;
        self.noise.reseed(seed.wrapping_add(self.ctx.rank() as u64));
        Ok(())
    }

    /// Restore a student checkpoint; returns the iteration to start from.
    pub fn resume(&mut self, path: impl AsRef<std::path::Path>) -> Result<usize> {
        let path = path.as_ref();
        let metadata = load_checkpoint(path, &mut self.models, &mut self.g_optim, &mut self.d_optim)?;
        self.models.enter(TrainingPhase::Idle);
        if let Some(meta) = metadata {
            self.state.ada_aug_p = meta.ada_aug_p;
            self.state.mean_path_length = meta.mean_path_length;
            self.state.mean_path_length_avg = meta.mean_path_length;
            if let Some(ada) = self.ada.as_mut() {
                ada.set_probability(meta.ada_aug_p);
            }
        }
        let start_iter = parse_resume_iteration(path);
        tracing::info!(path = %path.display(), start_iter, "resuming student");
        Ok(start_iter)
    }

    /// Write a checkpoint of the current state for `iteration`.
    pub fn save_checkpoint(&self, manager: &CheckpointManager, iteration: usize) -> Result<std::path::PathBuf> {
        let metadata = CheckpointMetadata::new(iteration, self.state.ada_aug_p, &self.config)
            .with_mean_path_length(self.state.mean_path_length);
        manager.save(&self.models, &self.g_optim, &self.d_optim, &metadata)
    }

    fn discriminator_step(&mut self, real: &Array, losses: &mut LossDict) -> Result<Array> {
        self.models.enter(TrainingPhase::DiscriminatorStep);
        self.models.check_scope()?;

        let noise = self.noise.sample(self.config.batch, self.config.mixing)?;
        let fake = stop_gradient(&self.models.generator.generate(&noise, false)?.image)?;

        let augment = self.augment.as_ref();
        let (use_aug, p) = (self.config.augment, self.state.ada_aug_p);
        let aux: RefCell<Option<(DiscriminatorLossOutput, Array)>> = RefCell::new(None);

        let grads = {
            let loss_fn = |d: &mut D, (real, fake): (&Array, &Array)| -> MlxResult<Array> {
                let (real_in, fake_in) = if use_aug {
                    (augment.augment(real, p)?.0, augment.augment(fake, p)?.0)
                } else {
                    (real.clone(), fake.clone())
                };
                let fake_pred = d.forward(&fake_in)?;
                let real_pred = d.forward(&real_in)?;
                let out = discriminator_loss(&real_pred, &fake_pred)?;
                let total = out.total.clone();
                *aux.borrow_mut() = Some((out, real_pred));
                Ok(total)
            };
            let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
            let (_, grads) = loss_and_grad_fn(&mut self.models.discriminator, (real, &fake))?;
            grads
        };

        let grads = self.ctx.average_gradients(grads)?;
        self.d_optim.update(&mut self.models.discriminator, grads)?;

        let (out, real_pred) = aux
            .into_inner()
            .ok_or_else(|| TrainerError::InvalidArgument("discriminator loss was not evaluated".into()))?;
        losses.insert("d".into(), out.total);
        losses.insert("real_score".into(), out.real_score);
        losses.insert("fake_score".into(), out.fake_score);
        Ok(stop_gradient(&real_pred)?)
    }

    fn r1_step(&mut self, real: &Array) -> Result<()> {
        let augment = self.augment.as_ref();
        let (use_aug, p) = (self.config.augment, self.state.ada_aug_p);
        let weight = self.config.r1 / 2.0 * self.config.d_reg_every as f32;
        let aux: RefCell<Option<Array>> = RefCell::new(None);

        let grads = {
            let loss_fn = |d: &mut D, real: &Array| -> MlxResult<Array> {
                let d: &D = d;
                let score = |x: &Array| -> MlxResult<Array> {
                    let x = if use_aug { augment.augment(x, p)?.0 } else { x.clone() };
                    d.forward(&x)
                };
                let penalty = r1_penalty(score, real)?;
                let weighted = penalty.multiply(Array::from_f32(weight))?;
                *aux.borrow_mut() = Some(penalty);
                Ok(weighted)
            };
            let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
            let (_, grads) = loss_and_grad_fn(&mut self.models.discriminator, real)?;
            grads
        };

        let grads = self.ctx.average_gradients(grads)?;
        self.d_optim.update(&mut self.models.discriminator, grads)?;

        if let Some(penalty) = aux.into_inner() {
            penalty.eval()?;
            self.state.r1_loss = penalty.item::<f32>();
        }
        Ok(())
    }

    fn generator_step(&mut self) -> Result<Array> {
        self.models.enter(TrainingPhase::GeneratorStep);
        self.models.check_scope()?;

        let noise = self.noise.sample(self.config.batch, self.config.mixing)?;
        let use_ka = self.config.kernel_alignment;
        let (use_aug, p) = (self.config.augment, self.state.ada_aug_p);
        let augment = self.augment.as_ref();

        let teacher_out = self.models.teacher.generate(&noise, use_ka)?;
        let teacher_maps = teacher_out
            .f_maps
            .iter()
            .map(|m| stop_gradient(m))
            .collect::<MlxResult<Vec<_>>>()?;
        let mut teacher_img = stop_gradient(&teacher_out.image)?;
        if use_aug {
            teacher_img = augment.augment(&teacher_img, p)?.0;
        }
        let size_s = self.config.size_s;
        let teacher_small = resize_bilinear(&teacher_img, size_s, size_s)?;

        let discriminator = &self.models.discriminator;
        let perceptual = self.perceptual.as_ref();
        let fatal: RefCell<Option<DistillError>> = RefCell::new(None);

        let (loss, grads) = {
            let loss_fn = |g: &mut G, (noise, teacher_small): (&[Array], &Array)| -> MlxResult<Array> {
                let out = g.generate(noise, use_ka)?;
                let fake = if use_aug {
                    augment.augment(&out.image, p)?.0
                } else {
                    out.image
                };
                let mut loss = g_nonsaturating_loss(&discriminator.forward(&fake)?)?;
                if use_ka {
                    match feature_alignment(&out.f_maps, &teacher_maps) {
                        Ok(ka) => loss = loss.subtract(&ka)?,
                        Err(e) => {
                            let message = e.to_string();
                            *fatal.borrow_mut() = Some(e);
                            return Err(Exception::custom(message));
                        }
                    }
                }
                if let Some(perceptual) = perceptual {
                    let distance = perceptual.distance(&fake, teacher_small)?;
                    loss = loss.add(&distance.mean(None)?)?;
                }
                Ok(loss)
            };
            let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
            let result = loss_and_grad_fn(&mut self.models.generator, (noise.as_slice(), &teacher_small));
            match result {
                Ok(value) => value,
                Err(e) => {
                    drop(loss_and_grad_fn);
                    return Err(match fatal.into_inner() {
                        Some(shape_error) => shape_error.into(),
                        None => e.into(),
                    });
                }
            }
        };

        let grads = self.ctx.average_gradients(grads)?;
        self.g_optim.update(&mut self.models.generator, grads)?;
        Ok(loss)
    }

    fn path_regularization_step(&mut self) -> Result<()> {
        let path_batch = self.config.path_batch_size();
        let noise = self.noise.sample(path_batch, self.config.mixing)?;
        let res = self.models.generator.resolution() as i32;
        let image_shape = [path_batch as i32, 3, res, res];
        let mean_path_length = self.state.mean_path_length;
        let weight = self.config.path_regularize * self.config.g_reg_every as f32;
        let aux: RefCell<Option<PathLengthOutput>> = RefCell::new(None);

        let grads = {
            let loss_fn = |g: &mut G, noise: &[Array]| -> MlxResult<Array> {
                let g: &G = g;
                let latents = g.map_styles(noise)?;
                let synthesize = |w: &Array| -> MlxResult<Array> { Ok(g.synthesize(w, false)?.image) };
                let out = path_length_penalty(
                    synthesize,
                    &latents,
                    &image_shape,
                    mean_path_length,
                    PATH_LENGTH_DECAY,
                )?;
                let weighted = out.penalty.multiply(Array::from_f32(weight))?;
                *aux.borrow_mut() = Some(out);
                Ok(weighted)
            };
            let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
            let (_, grads) = loss_and_grad_fn(&mut self.models.generator, noise.as_slice())?;
            grads
        };

        let grads = self.ctx.average_gradients(grads)?;
        self.g_optim.update(&mut self.models.generator, grads)?;

        if let Some(out) = aux.into_inner() {
            let path_length = out.path_lengths.mean(None)?;
            out.penalty.eval()?;
            out.mean_path_length.eval()?;
            path_length.eval()?;
            self.state.path_loss = out.penalty.item::<f32>();
            self.state.mean_path_length = out.mean_path_length.item::<f32>();
            self.state.path_length = path_length.item::<f32>();
            self.state.mean_path_length_avg = self.ctx.reduce_mean_scalar(self.state.mean_path_length)?;
        }
        Ok(())
    }

    /// Run iteration `i` on one real batch and return its reduced metrics.
    pub fn train_step(&mut self, i: usize, real: &Array) -> Result<StepMetrics> {
        let mut losses = LossDict::new();

        let real_pred = self.discriminator_step(real, &mut losses)?;

        if let Some(ada) = self.ada.as_mut() {
            self.state.ada_aug_p = ada.tune(&real_pred, &self.ctx)?;
            self.state.r_t_stat = ada.r_t_stat();
        }

        let r1_computed = i % self.config.d_reg_every == 0;
        if r1_computed {
            self.r1_step(real)?;
        }
        losses.insert("r1".into(), Array::from_f32(self.state.r1_loss));

        let g_loss = self.generator_step()?;
        losses.insert("g".into(), g_loss);

        let path_computed = i % self.config.g_reg_every == 0;
        if path_computed {
            self.path_regularization_step()?;
        }
        losses.insert("path".into(), Array::from_f32(self.state.path_loss));
        losses.insert("path_length".into(), Array::from_f32(self.state.path_length));

        self.models.enter(TrainingPhase::Idle);
        accumulate(&mut self.models.g_ema, &self.models.generator, self.ema_decay)?;

        let reduced = self.ctx.reduce_loss_dict(&losses)?;
        let get = |key: &str| reduced.get(key).copied().unwrap_or_default();
        self.state.iteration = i;

        Ok(StepMetrics {
            iteration: i,
            d: get("d"),
            g: get("g"),
            r1: get("r1"),
            path: get("path"),
            path_length: get("path_length"),
            mean_path_length: self.state.mean_path_length,
            mean_path_length_avg: self.state.mean_path_length_avg,
            real_score: get("real_score"),
            fake_score: get("fake_score"),
            ada_aug_p: self.state.ada_aug_p,
            r_t_stat: self.state.r_t_stat,
            r1_computed,
            path_computed,
        })
    }

    fn write_sample(&self, iteration: usize) -> Result<()> {
        let out = self
            .models
            .g_ema
            .generate(std::slice::from_ref(&self.sample_z), false)?;
        let path = self
            .config
            .sample_dir()
            .join(format!("{iteration:06}-student.png"));
        save_sample_grid(&stop_gradient(&out.image)?, &path)
    }

    /// Train iterations `start_iter..start_iter + config.iter`, stopping once
    /// the iteration exceeds `config.iter`.
    pub fn run(&mut self, loader: &mut InfiniteLoader, start_iter: usize) -> Result<TrainState> {
        let is_main = self.ctx.is_main();
        let checkpoints = if is_main {
            std::fs::create_dir_all(self.config.sample_dir())?;
            Some(CheckpointManager::new(self.config.checkpoint_dir())?)
        } else {
            None
        };

        if is_main {
            for cb in &mut self.callbacks {
                cb.on_train_start(start_iter);
            }
        }
        tracing::info!(start_iter, last_iter = self.config.iter, "starting compression");

        // At most `iter` steps, and never past iteration `iter` on resume.
        for step in 0..self.config.iter {
            let i = start_iter + step;
            if i > self.config.iter {
                tracing::info!("Done!");
                break;
            }

            let real = loader.next_batch()?;
            let metrics = self.train_step(i, &real)?;

            let Some(manager) = checkpoints.as_ref() else {
                continue;
            };
            for cb in &mut self.callbacks {
                cb.on_step_end(&metrics);
            }
            if i % self.config.sample_every == 0 {
                self.write_sample(i)?;
            }
            if i % self.config.save_every == 0 {
                let path = self.save_checkpoint(manager, i)?;
                for cb in &mut self.callbacks {
                    cb.on_save(&path);
                }
            }
        }

        if is_main {
            for cb in &mut self.callbacks {
                cb.on_train_end();
            }
        }
        Ok(self.state.clone())
    }
}
