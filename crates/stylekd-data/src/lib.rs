//! Real-image data for StyleKD training.
//!
//! - [`ImageFolderDataset`]: every PNG/JPEG under a directory, resized to the
//!   student resolution and mapped to `[-1, 1]`
//! - [`TensorDataset`]: images already in memory
//! - [`ImageLoader`]: shuffled, optionally flipped `[B, 3, H, W]` batches
//! - [`InfiniteLoader`]: cycles an [`ImageLoader`] forever, reshuffling per pass
//! - [`AugmentPipeline`]: differentiable stochastic augmentation with probability `p`

#![warn(missing_docs)]

pub mod augment;
pub mod dataset;
mod error;
pub mod loader;

pub use augment::{Augment, AugmentParams, AugmentPipeline};
pub use dataset::{ImageDataset, ImageFolderDataset, TensorDataset};
pub use error::{DataError, Result};
pub use loader::{ImageLoader, InfiniteLoader, LoaderConfig};
