//! Error types for training.

use thiserror::Error;

/// Errors that can occur while training.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// Configuration error.
    #[error("Config error: {0}")]
    Config(#[from] stylekd_core::StyleKdError),

    /// Network construction or weight IO error.
    #[error("Model error: {0}")]
    Model(#[from] stylekd_models::ModelError),

    /// Loss computation error.
    #[error("Loss error: {0}")]
    Distill(#[from] stylekd_distill::DistillError),

    /// Data loading error.
    #[error("Data error: {0}")]
    Data(#[from] stylekd_data::DataError),

    /// Cross-process reduction error.
    #[error("Distributed error: {0}")]
    Distributed(#[from] stylekd_distributed::DistributedError),

    /// A network is trainable outside the phase that owns it.
    #[error("Trainable scope violated in {phase}: {detail}")]
    Scope {
        /// Active phase.
        phase: String,
        /// Offending network.
        detail: String,
    },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint contents do not match the networks.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encode error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainerError>;
