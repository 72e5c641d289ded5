//! Core configuration and error types for StyleKD.
//!
//! StyleKD compresses a pretrained StyleGAN2-style teacher into a smaller
//! student generator/discriminator pair by adversarial training combined
//! with knowledge distillation. This crate holds the pieces shared by every
//! other crate in the workspace:
//!
//! - [`CompressConfig`], the single source of truth for all training knobs
//! - [`StyleKdError`] and the [`Result`] alias

#![warn(missing_docs)]

mod config;
mod error;

pub use config::*;
pub use error::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::CompressConfig;
    pub use crate::error::{Result, StyleKdError};
}
