//! Error types for distributed reduction.

use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Ranks contributed buffers of different lengths to one collective.
    #[error("Rank {rank} contributed {actual} values, expected {expected}")]
    IncoherentBuffer {
        /// Offending rank.
        rank: usize,
        /// Length established by the first rank.
        expected: usize,
        /// Length contributed by `rank`.
        actual: usize,
    },

    /// Invalid group configuration.
    #[error("Invalid group configuration: {0}")]
    InvalidGroup(String),

    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),
}

/// Result type for distributed operations.
pub type DistributedResult<T> = std::result::Result<T, DistributedError>;
