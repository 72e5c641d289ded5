//! Error types for StyleKD.

use thiserror::Error;

/// Result type alias for StyleKD core operations.
pub type Result<T> = std::result::Result<T, StyleKdError>;

/// Main error type for configuration and shared plumbing.
#[derive(Error, Debug)]
pub enum StyleKdError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i32>,
        /// Actual shape.
        actual: Vec<i32>,
    },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
