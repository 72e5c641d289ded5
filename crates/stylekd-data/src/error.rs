//! Error types for data loading.

use thiserror::Error;

/// Errors that can occur while reading or batching images.
#[derive(Debug, Error)]
pub enum DataError {
    /// The dataset cannot produce a single batch.
    #[error("Empty dataset: {0}")]
    Empty(String),

    /// A sample index is out of range.
    #[error("Sample index {index} out of range for dataset of {len}")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// Image decode error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),
}

/// Result type for data operations.
pub type Result<T> = std::result::Result<T, DataError>;
