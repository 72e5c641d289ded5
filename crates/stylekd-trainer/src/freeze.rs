//! Trainable-scope control for the four networks of a compression run.
//!
//! | phase             | teacher G | student G | student D | EMA G  |
//! |-------------------|-----------|-----------|-----------|--------|
//! | Idle              | frozen    | frozen    | frozen    | frozen |
//! | DiscriminatorStep | frozen    | frozen    | trainable | frozen |
//! | GeneratorStep     | frozen    | trainable | frozen    | frozen |

use std::fmt;

use mlx_rs::module::ModuleParameters;
use stylekd_models::{ImageDiscriminator, ImageGenerator};

use crate::{Result, TrainerError};

/// Freeze (`false`) or unfreeze (`true`) every parameter of `model`.
pub fn requires_grad<M: ModuleParameters>(model: &mut M, flag: bool) {
    if flag {
        model.unfreeze_parameters(true);
    } else {
        model.freeze_parameters(true);
    }
}

/// Whether `model` exposes no trainable parameters.
pub fn is_frozen<M: ModuleParameters>(model: &M) -> bool {
    model.trainable_parameters().flatten().is_empty()
}

/// Which network the current optimization step updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    /// No network is trainable.
    Idle,
    /// Only the student discriminator is trainable.
    DiscriminatorStep,
    /// Only the student generator is trainable.
    GeneratorStep,
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::DiscriminatorStep => "discriminator step",
            Self::GeneratorStep => "generator step",
        };
        f.write_str(name)
    }
}

/// Teacher generator, student pair and the student's EMA shadow.
#[derive(Debug)]
pub struct GanModels<G, D> {
    /// Pretrained generator being distilled. Never trainable.
    pub teacher: G,
    /// Student generator.
    pub generator: G,
    /// Student discriminator.
    pub discriminator: D,
    /// Exponential moving average of the student generator. Never trainable.
    pub g_ema: G,
    phase: TrainingPhase,
}

impl<G: ImageGenerator, D: ImageDiscriminator> GanModels<G, D> {
    /// Group the networks and freeze all of them.
    pub fn new(teacher: G, generator: G, discriminator: D, g_ema: G) -> Self {
        let mut models = Self {
            teacher,
            generator,
            discriminator,
            g_ema,
            phase: TrainingPhase::Idle,
        };
        models.enter(TrainingPhase::Idle);
        models
    }

    /// Current phase.
    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Apply the freeze table for `phase`.
    pub fn enter(&mut self, phase: TrainingPhase) {
        requires_grad(&mut self.teacher, false);
        requires_grad(&mut self.g_ema, false);
        requires_grad(
            &mut self.generator,
            phase == TrainingPhase::GeneratorStep,
        );
        requires_grad(
            &mut self.discriminator,
            phase == TrainingPhase::DiscriminatorStep,
        );
        self.phase = phase;
        tracing::trace!(%phase, "entered training phase");
    }

    /// Verify that the freeze flags match the current phase.
    pub fn check_scope(&self) -> Result<()> {
        let violation = |detail: &str| TrainerError::Scope {
            phase: self.phase.to_string(),
            detail: detail.to_string(),
        };
        if !is_frozen(&self.teacher) {
            return Err(violation("teacher generator is trainable"));
        }
        if !is_frozen(&self.g_ema) {
            return Err(violation("EMA generator is trainable"));
        }
        let g_trainable = self.phase == TrainingPhase::GeneratorStep;
        if is_frozen(&self.generator) == g_trainable {
            return Err(violation("student generator trainability"));
        }
        let d_trainable = self.phase == TrainingPhase::DiscriminatorStep;
        if is_frozen(&self.discriminator) == d_trainable {
            return Err(violation("student discriminator trainability"));
        }
        Ok(())
    }
}
