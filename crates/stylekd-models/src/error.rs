//! Error types for model construction and weight IO.

use thiserror::Error;

/// Errors that can occur while building or loading networks.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid network configuration.
    #[error("Invalid model configuration: {0}")]
    Config(String),

    /// A required weight was absent from the source map.
    #[error("Missing weight: {0}")]
    MissingWeight(String),

    /// A source weight does not fit the destination parameter.
    #[error("Shape mismatch for {key}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        key: String,
        /// Destination shape.
        expected: Vec<i32>,
        /// Source shape.
        actual: Vec<i32>,
    },

    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// Safetensors IO error.
    #[error("Safetensors IO error: {0}")]
    Io(#[from] mlx_rs::error::IoError),
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
