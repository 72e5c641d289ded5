//! Error types for loss computation.

use thiserror::Error;

/// Errors that can occur while computing losses.
#[derive(Debug, Error)]
pub enum DistillError {
    /// Teacher and student tensors that must agree on a dimension do not.
    #[error("Shape mismatch: teacher {teacher:?}, student {student:?}")]
    ShapeMismatch {
        /// Teacher shape.
        teacher: Vec<i32>,
        /// Student shape.
        student: Vec<i32>,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// Weight IO error.
    #[error("Model error: {0}")]
    Model(#[from] stylekd_models::ModelError),
}

/// Result type for loss operations.
pub type Result<T> = std::result::Result<T, DistillError>;
