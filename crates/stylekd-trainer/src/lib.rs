//! Training loop for StyleKD generator compression.
//!
//! This crate provides:
//! - The alternating discriminator/generator [`Trainer`] with lazy R1 and
//!   path-length regularization
//! - Adaptive augmentation control ([`AdaptiveAugment`])
//! - EMA tracking of the student generator ([`accumulate`])
//! - Trainable-scope bookkeeping for the four networks ([`GanModels`])
//! - Adam with lazy-regularization scaling ([`RegularizedAdam`])
//! - Checkpointing, sample grids and training callbacks
//!
//! ```ignore
//! use stylekd_trainer::{GanModels, ProgressCallback, Trainer};
//!
//! let models = GanModels::new(teacher, generator, discriminator, g_ema);
//! let mut trainer = Trainer::new(config, models, DistributedContext::default())?
//!     .with_callback(Box::new(ProgressCallback::new(total)));
//! trainer.run(&mut loader, 0)?;
//! ```

#![warn(missing_docs)]

pub mod ada;
pub mod callbacks;
pub mod checkpoint;
pub mod ema;
mod error;
pub mod freeze;
pub mod noise;
pub mod optim;
pub mod sampling;
pub mod training_loop;

pub use ada::{AdaptiveAugment, ADA_UPDATE_EVERY};
pub use callbacks::{
    progress_message, MetricsJsonCallback, ProgressCallback, StepMetrics, TrainingCallback,
};
pub use checkpoint::{
    load_checkpoint, load_teacher, parse_resume_iteration, CheckpointManager, CheckpointMetadata,
};
pub use ema::{accumulate, generator_ema_decay};
pub use error::{Result, TrainerError};
pub use freeze::{is_frozen, requires_grad, GanModels, TrainingPhase};
pub use noise::{make_noise, NoiseSampler};
pub use optim::{AdamConfig, AdamState, RegularizedAdam};
pub use sampling::{grid_nrow, make_grid, save_sample_grid};
pub use training_loop::{TrainState, Trainer};
