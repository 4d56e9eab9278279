//! Error types for setnet.

use thiserror::Error;

/// Setnet error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Feature width does not match the input width of a parametrized transform.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Tensor has the wrong number of axes.
    #[error("rank mismatch: expected a rank-{expected} tensor, got rank {got}")]
    RankMismatch { expected: usize, got: usize },

    /// A set batch with no sets, or sets with no elements.
    #[error("empty {axis} axis")]
    EmptyAxis { axis: &'static str },

    /// Unrecognized message-passing block tag.
    #[error("unknown block kind: {0:?} (expected one of plain, denoising, residual)")]
    UnknownBlockKind(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
